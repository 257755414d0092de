use std::io::Cursor;
use std::time::Duration;

use base64::Engine;
use image::{ImageFormat, ImageReader};
use reqwest::{Client, StatusCode};

use crate::models::job::ImageSource;

/// Image bytes with their detected format and dimensions.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl NormalizedImage {
    /// Sniff format and dimensions without decoding pixel data.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ImageSourceError> {
        let format = image::guess_format(&bytes)?;
        let (width, height) = ImageReader::with_format(Cursor::new(&bytes), format).into_dimensions()?;
        Ok(Self {
            bytes,
            format,
            width,
            height,
        })
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.to_mime_type(),
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Largest image accepted from a URL or an inline payload.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Turns job image sources (and provider artifacts) into raw image bytes.
pub struct ImageFetcher {
    http: Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ImageSourceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            max_bytes: MAX_IMAGE_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub async fn resolve(&self, source: &ImageSource) -> Result<NormalizedImage, ImageSourceError> {
        let bytes = match source {
            ImageSource::Url(url) => self.fetch(url).await?,
            ImageSource::Inline(data) => decode_inline(data)?,
        };
        if bytes.len() > self.max_bytes {
            return Err(ImageSourceError::TooLarge {
                limit: self.max_bytes,
            });
        }
        NormalizedImage::from_bytes(bytes)
    }

    /// Resolve an artifact reference: http(s) URLs are fetched, anything else is inline data.
    pub async fn resolve_reference(
        &self,
        reference: &str,
    ) -> Result<NormalizedImage, ImageSourceError> {
        let source = if reference.starts_with("http://") || reference.starts_with("https://") {
            ImageSource::Url(reference.to_string())
        } else {
            ImageSource::Inline(reference.to_string())
        };
        self.resolve(&source).await
    }

    /// Download `url`, refusing bodies larger than `max_bytes`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ImageSourceError> {
        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageSourceError::Status(status));
        }

        let limit = self.max_bytes;
        if response
            .content_length()
            .is_some_and(|length| length > limit as u64)
        {
            return Err(ImageSourceError::TooLarge { limit });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > limit {
                return Err(ImageSourceError::TooLarge { limit });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Decode a base64 payload, accepting an optional `data:<mime>;base64,` prefix.
pub fn decode_inline(data: &str) -> Result<Vec<u8>, ImageSourceError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, encoded)| encoded)
            .ok_or(ImageSourceError::MalformedDataUri)?,
        None => data,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(cleaned)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ImageSourceError {
    #[error("Image download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image download returned HTTP {0}")]
    Status(StatusCode),

    #[error("Image exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Malformed data URI")]
    MalformedDataUri,

    #[error("Invalid base64 image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Unreadable image: {0}")]
    Image(#[from] image::ImageError),
}

impl ImageSourceError {
    /// Network failures and server-side errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ImageSourceError::Http(_) => true,
            ImageSourceError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ImageSourceError::TooLarge { .. }
            | ImageSourceError::MalformedDataUri
            | ImageSourceError::Decode(_)
            | ImageSourceError::Image(_) => false,
        }
    }
}
