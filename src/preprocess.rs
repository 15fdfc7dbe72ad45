use crate::bitmap::Bitmap;
use crate::config::Preprocess;
use crate::error::RecognitionError;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessHint {
    pub source_dpi: Option<u32>,
    pub skip_filters: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptClass {
    Latin,
    Cyrillic,
    /// CJK and neighbouring scripts with dense, small glyphs.
    Dense,
    /// Connected or stacked scripts (Arabic, Hebrew, Indic, Thai).
    Complex,
}

impl ScriptClass {
    pub fn for_language(language: &str) -> Self {
        let lang = language.trim().to_ascii_lowercase();
        let base = lang
            .split(['+', '_', '-'])
            .next()
            .unwrap_or(lang.as_str());
        match base {
            "rus" | "ru" | "ukr" | "uk" | "bel" | "be" | "bul" | "bg" | "srp" | "sr" | "mkd"
            | "mk" | "kaz" | "kk" | "kir" | "mon" => ScriptClass::Cyrillic,
            "chi" | "zh" | "jpn" | "ja" | "kor" | "ko" | "vie" => ScriptClass::Dense,
            "ara" | "ar" | "fas" | "fa" | "urd" | "ur" | "heb" | "he" | "hin" | "hi" | "ben"
            | "bn" | "tam" | "ta" | "tel" | "te" | "tha" | "th" | "mar" | "nep" => {
                ScriptClass::Complex
            }
            _ => ScriptClass::Latin,
        }
    }

    fn wants_strong_filters(self) -> bool {
        !matches!(self, ScriptClass::Latin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageStats {
    pub width: u32,
    pub height: u32,
    pub mean_brightness: f32,
    pub contrast: f32,
    pub noise: f32,
}

#[derive(Debug, Clone)]
pub struct EngineBitmap {
    pub image: GrayImage,
    pub language: String,
    pub script: ScriptClass,
    pub scale: f32,
    pub filters: Vec<&'static str>,
    pub stats: ImageStats,
}

impl EngineBitmap {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    cfg: Preprocess,
}

impl Preprocessor {
    pub fn new(cfg: &Preprocess) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn is_heavy(&self, bitmap: &Bitmap) -> bool {
        bitmap.pixel_count() > self.cfg.blocking_pixel_threshold
    }

    /// Runs `prepare`, moving large bitmaps onto the blocking pool.
    pub async fn prepare_shared(
        &self,
        bitmap: Arc<Bitmap>,
        language: &str,
        hint: &PreprocessHint,
    ) -> Result<EngineBitmap, RecognitionError> {
        if !self.is_heavy(&bitmap) {
            return self.prepare(&bitmap, language, hint);
        }
        let this = self.clone();
        let language = language.to_string();
        let hint = hint.clone();
        tokio::task::spawn_blocking(move || this.prepare(&bitmap, &language, &hint))
            .await
            .map_err(|e| RecognitionError::invalid_input(format!("preprocessing aborted: {e}")))?
    }

    pub fn prepare(
        &self,
        bitmap: &Bitmap,
        language: &str,
        hint: &PreprocessHint,
    ) -> Result<EngineBitmap, RecognitionError> {
        bitmap.validate()?;
        let script = ScriptClass::for_language(language);

        let gray = bitmap.to_gray()?;
        let stats = analyze(&gray);

        let dpi = hint
            .source_dpi
            .or(bitmap.dpi())
            .unwrap_or(self.cfg.assumed_dpi);
        let scale = self.scale_factor(gray.width(), gray.height(), dpi);

        let mut filters = Vec::new();
        let mut image = if (scale - 1.0).abs() > f32::EPSILON {
            let (w, h) = scaled_dims(gray.width(), gray.height(), scale, self.cfg.max_pixels);
            let filter = if scale > 1.0 {
                FilterType::Lanczos3
            } else {
                FilterType::Triangle
            };
            filters.push(if scale > 1.0 { "upscale" } else { "downscale" });
            // The unscaled intermediate is released here.
            imageops::resize(&gray, w, h, filter)
        } else {
            gray
        };

        if !hint.skip_filters {
            image = self.apply_filters(image, script, &stats, &mut filters);
        }

        debug!(
            "prepared {}x{} -> {}x{} lang={} script={:?} dpi={} scale={:.2} filters={:?}",
            bitmap.width(),
            bitmap.height(),
            image.width(),
            image.height(),
            language,
            script,
            dpi,
            scale,
            filters
        );

        Ok(EngineBitmap {
            image,
            language: language.to_string(),
            script,
            scale,
            filters,
            stats,
        })
    }

    pub fn scale_factor(&self, width: u32, height: u32, dpi: u32) -> f32 {
        let mut scale = 1.0f32;
        if dpi > 0 && dpi < self.cfg.min_effective_dpi {
            scale = (self.cfg.target_dpi as f32 / dpi as f32).clamp(1.0, self.cfg.max_upscale);
        }

        let pixels = width as f64 * height as f64;
        let scaled = pixels * (scale as f64) * (scale as f64);
        if scaled > self.cfg.max_pixels as f64 {
            scale = (self.cfg.max_pixels as f64 / pixels).sqrt() as f32;
        }
        scale
    }

    fn apply_filters(
        &self,
        image: GrayImage,
        script: ScriptClass,
        stats: &ImageStats,
        applied: &mut Vec<&'static str>,
    ) -> GrayImage {
        let mut image = image;

        if stats.noise > self.cfg.noise_threshold {
            image = imageops::blur(&image, 0.5);
            applied.push("denoise");
        }

        if script.wants_strong_filters() {
            stretch_contrast(&mut image);
            applied.push("stretch");
            image = imageops::contrast(&image, self.cfg.dense_contrast_boost);
            applied.push("contrast");
            image = imageops::unsharpen(
                &image,
                self.cfg.sharpen_sigma,
                self.cfg.sharpen_threshold,
            );
            applied.push("sharpen");
        } else if stats.contrast < self.cfg.low_contrast_threshold {
            stretch_contrast(&mut image);
            applied.push("stretch");
        }

        image
    }
}

fn scaled_dims(width: u32, height: u32, scale: f32, max_pixels: u64) -> (u32, u32) {
    let w = ((width as f32 * scale).round() as u32).max(1);
    let h = ((height as f32 * scale).round() as u32).max(1);
    if w as u64 * h as u64 <= max_pixels {
        return (w, h);
    }
    // Rounding up both sides can overshoot the budget.
    let mut w = ((width as f64 * scale as f64).floor() as u32).max(1);
    let mut h = ((height as f64 * scale as f64).floor() as u32).max(1);
    while w as u64 * h as u64 > max_pixels && (w > 1 || h > 1) {
        if w >= h {
            w -= 1;
        } else {
            h -= 1;
        }
    }
    (w, h)
}

pub fn analyze(img: &GrayImage) -> ImageStats {
    let (width, height) = img.dimensions();
    let pixels = width as u64 * height as u64;
    let stride = if pixels > 4_000_000 {
        10
    } else if pixels > 250_000 {
        4
    } else {
        1
    };

    let mut sum = 0u64;
    let mut count = 0u64;
    for y in (0..height).step_by(stride) {
        for x in (0..width).step_by(stride) {
            sum += img.get_pixel(x, y)[0] as u64;
            count += 1;
        }
    }
    let mean = if count > 0 {
        sum as f32 / count as f32
    } else {
        128.0
    };

    let mut var_sum = 0.0f64;
    for y in (0..height).step_by(stride) {
        for x in (0..width).step_by(stride) {
            let d = img.get_pixel(x, y)[0] as f64 - mean as f64;
            var_sum += d * d;
        }
    }
    let variance = if count > 0 {
        var_sum / count as f64
    } else {
        0.0
    };

    ImageStats {
        width,
        height,
        mean_brightness: mean,
        contrast: (variance.sqrt() / 255.0) as f32,
        noise: estimate_noise(img, stride.max(2)),
    }
}

fn estimate_noise(img: &GrayImage, stride: usize) -> f32 {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let mut total = 0.0f32;
    let mut count = 0u32;
    for y in (1..height - 1).step_by(stride) {
        for x in (1..width - 1).step_by(stride) {
            let center = img.get_pixel(x, y)[0] as f32;
            let mut neighbours = 0.0f32;
            for dy in [-1i32, 0, 1] {
                for dx in [-1i32, 0, 1] {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i32 + dx) as u32;
                    let ny = (y as i32 + dy) as u32;
                    neighbours += img.get_pixel(nx, ny)[0] as f32;
                }
            }
            total += (center - neighbours / 8.0).abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f32 / 255.0
    }
}

fn stretch_contrast(img: &mut GrayImage) {
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    for p in img.pixels() {
        lo = lo.min(p[0]);
        hi = hi.max(p[0]);
    }
    if hi <= lo {
        return;
    }
    let range = (hi - lo) as f32;
    for p in img.pixels_mut() {
        p[0] = (((p[0] - lo) as f32 / range) * 255.0).round() as u8;
    }
}
