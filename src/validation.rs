//! Upload validation
//!
//! Uploads are checked in the order that lets us reject as early as possible:
//! declared size first, then filename and declared MIME type, then the actual
//! bytes are sniffed and decoded. The client's headers are never trusted on
//! their own.

use std::path::Path;

use axum::body::Bytes;
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/bmp", "image/tiff"];
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("corrupt image content: {0}")]
    CorruptContent(String),

    #[error("invalid file name: {0:?}")]
    PathTraversalAttempt(String),
}

/// Raw upload as received from the client
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

impl UploadedImage {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// An upload that passed every check
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub mime_type: &'static str,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_file_size: u64,
}

impl UploadPolicy {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn check_size(&self, size: u64) -> Result<(), ValidationError> {
        if size > self.max_file_size {
            return Err(ValidationError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Rejects names that could escape a target directory, then checks the extension.
    pub fn check_filename(&self, filename: &str) -> Result<(), ValidationError> {
        let has_separator = filename.contains(['/', '\\', ':', '\0']);
        if has_separator || filename == "." || filename == ".." {
            tracing::warn!("Rejected upload file name {:?}", filename);
            return Err(ValidationError::PathTraversalAttempt(filename.to_string()));
        }

        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
            Some(ext) => {
                tracing::warn!("Invalid file extension: .{}", ext);
                Err(ValidationError::UnsupportedType(format!("extension .{}", ext)))
            }
            None => Err(ValidationError::UnsupportedType(format!(
                "file name {:?} has no extension",
                filename
            ))),
        }
    }

    /// Normalizes the declared MIME type and checks it against the allow list
    pub fn check_declared_type(&self, content_type: Option<&str>) -> Result<&'static str, ValidationError> {
        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
            .ok_or_else(|| ValidationError::UnsupportedType("missing content type".to_string()))?;

        let canonical = if declared == "image/jpg" { "image/jpeg" } else { declared.as_str() };

        ALLOWED_MIME_TYPES
            .iter()
            .find(|allowed| **allowed == canonical)
            .copied()
            .ok_or_else(|| {
                tracing::warn!("Invalid MIME type: {}", declared);
                ValidationError::UnsupportedType(declared.clone())
            })
    }

    pub fn validate(&self, upload: &UploadedImage) -> Result<DecodedImage, ValidationError> {
        self.check_size(upload.size())?;

        if let Some(filename) = &upload.filename {
            self.check_filename(filename)?;
        }

        let declared = self.check_declared_type(upload.content_type.as_deref())?;

        if upload.bytes.is_empty() {
            return Err(ValidationError::CorruptContent("empty file".to_string()));
        }

        let format = image::guess_format(&upload.bytes)
            .map_err(|_| ValidationError::CorruptContent("unrecognized image data".to_string()))?;

        let actual = format.to_mime_type();
        if actual != declared {
            tracing::warn!("Declared {} but content is {}", declared, actual);
            return Err(ValidationError::UnsupportedType(format!(
                "declared {} but content is {}",
                declared, actual
            )));
        }

        let image = image::load_from_memory_with_format(&upload.bytes, format)
            .map_err(|e| ValidationError::CorruptContent(e.to_string()))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(ValidationError::CorruptContent("image has no pixels".to_string()));
        }

        let filename = upload
            .filename
            .clone()
            .unwrap_or_else(|| format!("image.{}", format.extensions_str().first().unwrap_or(&"img")));

        Ok(DecodedImage {
            image,
            format,
            mime_type: actual,
            filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn encoded(format: ImageFormat) -> Bytes {
        let img = RgbImage::from_pixel(16, 12, Rgb([10, 200, 30]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn upload(bytes: Bytes, content_type: &str, filename: &str) -> UploadedImage {
        UploadedImage {
            bytes,
            content_type: Some(content_type.to_string()),
            filename: Some(filename.to_string()),
        }
    }

    #[test]
    fn test_accepts_valid_png() {
        let policy = UploadPolicy::new(1024 * 1024);
        let decoded = policy
            .validate(&upload(encoded(ImageFormat::Png), "image/png", "board.png"))
            .unwrap();
        assert_eq!(decoded.format, ImageFormat::Png);
        assert_eq!((decoded.image.width(), decoded.image.height()), (16, 12));
        assert_eq!(decoded.filename, "board.png");
    }

    #[test]
    fn test_jpg_alias_and_parameters() {
        let policy = UploadPolicy::new(1024 * 1024);
        let decoded = policy
            .validate(&upload(encoded(ImageFormat::Jpeg), "Image/JPG; charset=binary", "board.JPG"))
            .unwrap();
        assert_eq!(decoded.mime_type, "image/jpeg");
    }

    #[test]
    fn test_reject_oversize_before_decoding() {
        let policy = UploadPolicy::new(8);
        let result = policy.validate(&upload(Bytes::from_static(b"definitely not an image"), "image/png", "a.png"));
        assert_eq!(
            result.unwrap_err(),
            ValidationError::TooLarge { size: 23, limit: 8 }
        );
    }

    #[test]
    fn test_reject_non_image_mime() {
        let policy = UploadPolicy::new(1024);
        let result = policy.validate(&upload(Bytes::from_static(b"hello"), "text/plain", "notes.png"));
        assert!(matches!(result, Err(ValidationError::UnsupportedType(_))));
    }

    #[test]
    fn test_reject_missing_content_type() {
        let policy = UploadPolicy::new(1024 * 1024);
        let mut up = upload(encoded(ImageFormat::Png), "image/png", "a.png");
        up.content_type = None;
        assert!(matches!(policy.validate(&up), Err(ValidationError::UnsupportedType(_))));
    }

    #[test]
    fn test_reject_spoofed_mime() {
        let policy = UploadPolicy::new(1024 * 1024);
        let result = policy.validate(&upload(encoded(ImageFormat::Png), "image/jpeg", "a.jpg"));
        match result {
            Err(ValidationError::UnsupportedType(msg)) => assert!(msg.contains("image/png")),
            other => panic!("Expected UnsupportedType, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_corrupt_content() {
        let policy = UploadPolicy::new(1024 * 1024);
        let result = policy.validate(&upload(Bytes::from_static(b"\x00\x01garbage"), "image/png", "a.png"));
        assert!(matches!(result, Err(ValidationError::CorruptContent(_))));
    }

    #[test]
    fn test_reject_truncated_png() {
        let policy = UploadPolicy::new(1024 * 1024);
        let full = encoded(ImageFormat::Png);
        let truncated = full.slice(..full.len() / 2);
        let result = policy.validate(&upload(truncated, "image/png", "a.png"));
        assert!(matches!(result, Err(ValidationError::CorruptContent(_))));
    }

    #[test]
    fn test_reject_empty_file() {
        let policy = UploadPolicy::new(1024);
        let result = policy.validate(&upload(Bytes::new(), "image/png", "a.png"));
        assert!(matches!(result, Err(ValidationError::CorruptContent(_))));
    }

    #[test]
    fn test_reject_traversal_names() {
        let policy = UploadPolicy::new(1024);
        for name in ["../../etc/passwd.png", "..\\boot.ini.png", "C:evil.png", "..", "/abs.png"] {
            assert!(
                matches!(policy.check_filename(name), Err(ValidationError::PathTraversalAttempt(_))),
                "{} should be rejected",
                name
            );
        }
        assert!(policy.check_filename("board..v2.png").is_ok());
    }

    #[test]
    fn test_reject_bad_extension() {
        let policy = UploadPolicy::new(1024);
        assert!(matches!(policy.check_filename("payload.exe"), Err(ValidationError::UnsupportedType(_))));
        assert!(matches!(policy.check_filename("noext"), Err(ValidationError::UnsupportedType(_))));
        assert!(policy.check_filename("scan.TIF").is_ok());
    }

    #[test]
    fn test_default_filename_from_format() {
        let policy = UploadPolicy::new(1024 * 1024);
        let mut up = upload(encoded(ImageFormat::Png), "image/png", "x.png");
        up.filename = None;
        assert_eq!(policy.validate(&up).unwrap().filename, "image.png");
    }
}
