//! Photo service: re-encodes uploaded images into the configured format.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use courier_core::{CapabilityError, CapabilityResult, MessageKind};
use courier_messaging::handler::Payload;
use courier_messaging::{CapabilityHandler, HandlerRegistry};

use crate::required_str;

/// Converts a file inside an upload directory, returning the new file name.
#[async_trait]
pub trait PhotoConverter: Send + Sync {
    async fn convert(&self, filename: &str) -> CapabilityResult<String>;
}

/// Output formats the converter can write.
pub fn parse_format(name: &str) -> Result<ImageFormat, String> {
    match name.to_ascii_lowercase().as_str() {
        "webp" => Ok(ImageFormat::WebP),
        "png" => Ok(ImageFormat::Png),
        "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
        other => Err(format!("unsupported photo format '{other}' (expected webp, png or jpeg)")),
    }
}

/// [`PhotoConverter`] backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageConverter {
    upload_dir: PathBuf,
    format: ImageFormat,
}

impl ImageConverter {
    pub fn new(upload_dir: impl Into<PathBuf>, format: ImageFormat) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            format,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    fn output_name(&self, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .map_or_else(|| filename.to_string(), |s| s.to_string_lossy().into_owned());
        let ext = self.format.extensions_str().first().copied().unwrap_or("img");
        format!("{stem}.{ext}")
    }
}

/// Reject anything but a bare file name so requests cannot leave the upload directory.
fn plain_file_name(filename: &str) -> CapabilityResult<&str> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(filename),
        _ => Err(CapabilityError::invalid_input(format!(
            "'{filename}' is not a plain file name"
        ))),
    }
}

#[async_trait]
impl PhotoConverter for ImageConverter {
    async fn convert(&self, filename: &str) -> CapabilityResult<String> {
        let filename = plain_file_name(filename)?;
        let source = self.upload_dir.join(filename);
        let output = self.output_name(filename);
        if output == filename {
            return Err(CapabilityError::invalid_input(format!(
                "{filename} is already in the target format"
            )));
        }
        let target = self.upload_dir.join(&output);
        let format = self.format;
        // Errors name files relative to the upload directory only.
        let (source_name, target_name) = (filename.to_string(), output.clone());

        tokio::task::spawn_blocking(move || {
            if !source.is_file() {
                return Err(CapabilityError::not_found(format!(
                    "{source_name} does not exist"
                )));
            }
            let decoded = image::open(&source).map_err(|e| {
                CapabilityError::invalid_input(format!("cannot decode {source_name}: {e}"))
            })?;
            // WebP and PNG keep alpha; JPEG has none.
            let encoded = match format {
                ImageFormat::Jpeg => image::DynamicImage::ImageRgb8(decoded.to_rgb8()),
                _ => image::DynamicImage::ImageRgba8(decoded.to_rgba8()),
            };
            encoded.save_with_format(&target, format).map_err(|e| {
                CapabilityError::external(format!("cannot write {target_name}: {e}"))
            })
        })
        .await
        .map_err(|e| CapabilityError::Aborted(e.to_string()))??;

        info!(source = %filename, output = %output, "photo converted");
        Ok(output)
    }
}

/// Adapts any [`PhotoConverter`] to the photo queue.
pub struct PhotoHandler {
    converter: Arc<dyn PhotoConverter>,
}

impl PhotoHandler {
    pub fn new(converter: Arc<dyn PhotoConverter>) -> Self {
        Self { converter }
    }

    pub fn handlers(self) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.register(MessageKind::ConvertPhoto, Arc::new(self));
        handlers
    }
}

#[async_trait]
impl CapabilityHandler for PhotoHandler {
    async fn handle(&self, _kind: MessageKind, payload: Payload) -> CapabilityResult<JsonValue> {
        let filename = required_str(&payload, "filename")?;
        Ok(json!(self.converter.convert(&filename).await?))
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("courier-photo-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(dir: &Path, name: &str) {
        let img = ImageBuffer::from_fn(4, 3, |x, y| Rgba([x as u8 * 60, y as u8 * 80, 128, 255]));
        img.save_with_format(dir.join(name), ImageFormat::Png).unwrap();
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!(parse_format("WebP"), Ok(ImageFormat::WebP));
        assert_eq!(parse_format("jpg"), Ok(ImageFormat::Jpeg));
        assert!(parse_format("gif").is_err());
    }

    #[tokio::test]
    async fn converts_png_to_webp_next_to_the_source() {
        let dir = scratch_dir();
        write_png(&dir, "cat.png");
        let converter = ImageConverter::new(&dir, ImageFormat::WebP);

        let output = converter.convert("cat.png").await.unwrap();
        assert_eq!(output, "cat.webp");
        let converted = image::open(dir.join(&output)).unwrap();
        assert_eq!((converted.width(), converted.height()), (4, 3));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn converts_to_jpeg_dropping_alpha() {
        let dir = scratch_dir();
        write_png(&dir, "dog.png");
        let converter = ImageConverter::new(&dir, ImageFormat::Jpeg);

        assert_eq!(converter.convert("dog.png").await.unwrap(), "dog.jpg");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = scratch_dir();
        let converter = ImageConverter::new(&dir, ImageFormat::WebP);
        let err = converter.convert("ghost.png").await.unwrap_err();
        assert_eq!(err, CapabilityError::not_found("ghost.png does not exist"));
        assert!(!err.to_string().contains(&*dir.to_string_lossy()));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn file_already_in_the_target_format_is_left_alone() {
        let dir = scratch_dir();
        write_png(&dir, "cat.png");
        let before = std::fs::read(dir.join("cat.png")).unwrap();
        let converter = ImageConverter::new(&dir, ImageFormat::Png);

        let err = converter.convert("cat.png").await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(ref msg) if msg.contains("cat.png")), "{err}");
        assert_eq!(std::fs::read(dir.join("cat.png")).unwrap(), before);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn undecodable_file_is_invalid_input() {
        let dir = scratch_dir();
        std::fs::write(dir.join("notes.png"), b"definitely not a png").unwrap();
        let converter = ImageConverter::new(&dir, ImageFormat::WebP);
        let err = converter.convert("notes.png").await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(ref msg) if msg.starts_with("cannot decode notes.png")), "{err}");
        assert!(!err.to_string().contains(&*dir.to_string_lossy()));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn paths_outside_the_upload_dir_are_rejected() {
        let converter = ImageConverter::new(scratch_dir(), ImageFormat::WebP);
        for name in ["../etc/passwd", "/etc/passwd", "a/b.png", ".."] {
            let err = converter.convert(name).await.unwrap_err();
            assert!(matches!(err, CapabilityError::InvalidInput(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn handler_uses_any_converter() {
        struct Upper;

        #[async_trait]
        impl PhotoConverter for Upper {
            async fn convert(&self, filename: &str) -> CapabilityResult<String> {
                Ok(filename.to_uppercase())
            }
        }

        let handler = PhotoHandler::new(Arc::new(Upper));
        let mut payload = Payload::new();
        payload.insert("filename".into(), json!("a.png"));
        assert_eq!(
            handler.handle(MessageKind::ConvertPhoto, payload).await,
            Ok(json!("A.PNG"))
        );
    }
}
