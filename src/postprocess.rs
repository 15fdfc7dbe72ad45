//! Cleanup applied to engine text before it is handed back to callers.

use crate::config::Postprocess;
use anyhow::{Context, Result};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone)]
pub struct TextCleaner {
    cfg: Postprocess,
    noise_lines: Vec<Regex>,
    blank_run: Option<Regex>,
}

impl TextCleaner {
    pub fn new(cfg: &Postprocess) -> Result<Self> {
        let noise_lines = if cfg.remove_noise_lines {
            cfg.noise_line_patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("noise line pattern: {p}")))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let blank_run = if cfg.collapse_blank_lines {
            // More than `max_blank_lines` empty lines in a row.
            let pattern = format!("\n{{{},}}", cfg.max_blank_lines + 2);
            Some(Regex::new(&pattern).with_context(|| "blank line pattern")?)
        } else {
            None
        };
        Ok(Self {
            cfg: cfg.clone(),
            noise_lines,
            blank_run,
        })
    }

    pub fn clean(&self, text: &str) -> String {
        let mut s = text.to_string();

        if self.cfg.normalize_newlines {
            s = s.replace("\r\n", "\n").replace('\r', "\n");
        }

        if self.cfg.normalize_unicode {
            s = s.nfkc().collect::<String>();
        }

        s = sanitize_control_chars(&s, &self.cfg.control_chars_to_sanitize);

        if self.cfg.trim_trailing_whitespace || !self.noise_lines.is_empty() {
            s = s
                .lines()
                .filter(|l| !self.is_noise(l))
                .map(|l| {
                    if self.cfg.trim_trailing_whitespace {
                        l.trim_end()
                    } else {
                        l
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
        }

        if let Some(re) = &self.blank_run {
            let keep = "\n".repeat(self.cfg.max_blank_lines + 1);
            s = re.replace_all(&s, keep.as_str()).into_owned();
        }

        s.trim_matches('\n').to_string()
    }

    fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();
        !trimmed.is_empty() && self.noise_lines.iter().any(|r| r.is_match(trimmed))
    }
}

fn sanitize_control_chars(s: &str, codes: &[u8]) -> String {
    if codes.is_empty() {
        return s.to_string();
    }

    let mut mask = [false; 128];
    for &code in codes {
        if (code as usize) < mask.len() {
            mask[code as usize] = true;
        }
    }

    s.chars()
        .filter(|&ch| {
            // Structural whitespace survives regardless of the mask.
            if ch == '\n' || ch == '\t' {
                return true;
            }
            let cp = ch as u32;
            if cp < 128 {
                !mask[cp as usize]
            } else {
                !(0x80..=0x9f).contains(&cp)
            }
        })
        .collect()
}
