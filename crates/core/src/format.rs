use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code naming a stream's pixel or blob format.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"NV12");
/// assert_eq!(fcc.to_string(), "NV12");
/// assert_eq!("JPEG".parse::<FourCc>().unwrap(), FourCc::JPEG);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    pub const NV12: FourCc = FourCc::new(*b"NV12");
    pub const YUYV: FourCc = FourCc::new(*b"YUYV");
    pub const JPEG: FourCc = FourCc::new(*b"JPEG");
    pub const RAW16: FourCc = FourCc::new(*b"R16 ");

    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Approximate storage cost in bits per pixel; compressed formats report a
    /// worst-case bound.
    pub fn bits_per_pixel(self) -> usize {
        match &self.0 {
            b"NV12" => 12,
            b"YUYV" | b"R16 " => 16,
            b"JPEG" => 24,
            _ => 32,
        }
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| "fourcc must be four ASCII bytes".to_string())?;
        Ok(FourCc(bytes))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Dimensions of a stream's buffers.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.pixels(), 307_200);
/// assert!(Resolution::new(0, 480).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    pub fn pixels(&self) -> usize {
        self.width.get() as usize * self.height.get() as usize
    }
}

/// Format a stream was created with; the pipeline never negotiates it.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{FourCc, Resolution, StreamFormat};
///
/// let fmt = StreamFormat::new(FourCc::NV12, Resolution::new(4, 4).unwrap());
/// assert_eq!(fmt.frame_bytes(), 24);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamFormat {
    pub code: FourCc,
    pub resolution: Resolution,
}

impl StreamFormat {
    pub fn new(code: FourCc, resolution: Resolution) -> Self {
        Self { code, resolution }
    }

    /// Bytes needed to hold one frame of this format.
    pub fn frame_bytes(&self) -> usize {
        (self.resolution.pixels() * self.code.bits_per_pixel()).div_ceil(8)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}",
            self.code,
            self.resolution.width,
            self.resolution.height
        )
    }
}
