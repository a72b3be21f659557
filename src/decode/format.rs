/// Image container formats recognized from leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Ico,
    Tiff,
    Unknown,
}

impl ImageFormat {
    pub fn is_known(self) -> bool {
        self != ImageFormat::Unknown
    }
}

/// Detect the image format from the first few bytes of a payload.
pub fn detect_format(header: &[u8]) -> ImageFormat {
    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if header.len() >= 8 && header[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return ImageFormat::Png;
    }

    // JPEG: SOI marker followed by another marker
    if header.len() >= 3 && header[0..3] == [0xFF, 0xD8, 0xFF] {
        return ImageFormat::Jpeg;
    }

    if header.len() >= 6 && (&header[0..6] == b"GIF87a" || &header[0..6] == b"GIF89a") {
        return ImageFormat::Gif;
    }

    // WebP: "RIFF" <size> "WEBP"
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return ImageFormat::WebP;
    }

    if header.len() >= 2 && &header[0..2] == b"BM" {
        return ImageFormat::Bmp;
    }

    if header.len() >= 4 && header[0..4] == [0x00, 0x00, 0x01, 0x00] {
        return ImageFormat::Ico;
    }

    // TIFF: little-endian "II*\0" or big-endian "MM\0*"
    if header.len() >= 4
        && (header[0..4] == [b'I', b'I', 0x2A, 0x00] || header[0..4] == [b'M', b'M', 0x00, 0x2A])
    {
        return ImageFormat::Tiff;
    }

    ImageFormat::Unknown
}
