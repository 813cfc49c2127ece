use std::{collections::BTreeMap, fmt};

use smallvec::SmallVec;

/// Strongly typed metadata tag identifier.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{Tag, tags};
///
/// assert_eq!(tags::REQUEST_ID, Tag::new(0x000e_0001));
/// assert_eq!(tags::REQUEST_ID.to_string(), "request.id");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tag(pub u32);

impl Tag {
    /// Construct from the raw section/index encoding.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Section half of the tag (upper 16 bits).
    pub const fn section(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match tags::name(*self) {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}

/// Value stored under a metadata tag. Entries are short arrays, mostly of length one.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::MetadataValue;
///
/// let v = MetadataValue::i32s(&[15, 30]);
/// assert_eq!(v.as_i32(), Some(15));
/// assert_eq!(v.i32_slice(), Some(&[15, 30][..]));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "value", rename_all = "snake_case"))]
pub enum MetadataValue {
    U8(SmallVec<[u8; 4]>),
    I32(SmallVec<[i32; 4]>),
    I64(SmallVec<[i64; 2]>),
    F32(SmallVec<[f32; 4]>),
    F64(SmallVec<[f64; 2]>),
    Text(String),
}

impl MetadataValue {
    pub fn u8(value: u8) -> Self {
        Self::U8(SmallVec::from_slice(&[value]))
    }

    pub fn i32(value: i32) -> Self {
        Self::I32(SmallVec::from_slice(&[value]))
    }

    pub fn i32s(values: &[i32]) -> Self {
        Self::I32(SmallVec::from_slice(values))
    }

    pub fn i64(value: i64) -> Self {
        Self::I64(SmallVec::from_slice(&[value]))
    }

    pub fn f32(value: f32) -> Self {
        Self::F32(SmallVec::from_slice(&[value]))
    }

    /// Number of elements in the entry.
    pub fn count(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Text(_) => 1,
        }
    }

    /// First element as `u8`.
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Self::U8(v) => v.first().copied(),
            _ => None,
        }
    }

    /// First element as `i32`; byte entries widen.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => v.first().copied(),
            Self::U8(v) => v.first().map(|b| i32::from(*b)),
            _ => None,
        }
    }

    /// First element as `i64`; narrower integer entries widen.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => v.first().copied(),
            Self::I32(v) => v.first().map(|x| i64::from(*x)),
            Self::U8(v) => v.first().map(|b| i64::from(*b)),
            _ => None,
        }
    }

    pub fn i32_slice(&self) -> Option<&[i32]> {
        match self {
            Self::I32(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::U8(_) => "u8",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Text(_) => "text",
        }
    }
}

/// Errors from typed metadata lookups.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("tag {0} not present")]
    Missing(Tag),
    #[error("tag {tag} holds {actual}, expected {expected}")]
    TypeMismatch {
        tag: Tag,
        expected: &'static str,
        actual: &'static str,
    },
}

impl MetadataError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            MetadataError::Missing(_) => "metadata_missing",
            MetadataError::TypeMismatch { .. } => "metadata_type_mismatch",
        }
    }
}

/// Ordered tag/value map used for request settings and result metadata.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{MetadataValue, Settings, tags};
///
/// let mut settings = Settings::new();
/// settings.set(tags::REQUEST_ID, MetadataValue::i32(7));
/// assert_eq!(settings.i32(tags::REQUEST_ID).unwrap(), 7);
/// assert!(settings.get(tags::CONTROL_AF_TRIGGER).is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings {
    entries: BTreeMap<Tag, MetadataValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, tag: Tag, value: MetadataValue) -> Self {
        self.set(tag, value);
        self
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn set(&mut self, tag: Tag, value: MetadataValue) -> Option<MetadataValue> {
        self.entries.insert(tag, value)
    }

    pub fn get(&self, tag: Tag) -> Option<&MetadataValue> {
        self.entries.get(&tag)
    }

    pub fn remove(&mut self, tag: Tag) -> Option<MetadataValue> {
        self.entries.remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &MetadataValue)> {
        self.entries.iter().map(|(tag, value)| (*tag, value))
    }

    /// Typed lookup of the first `i32` element.
    pub fn i32(&self, tag: Tag) -> Result<i32, MetadataError> {
        let value = self.get(tag).ok_or(MetadataError::Missing(tag))?;
        value.as_i32().ok_or(MetadataError::TypeMismatch {
            tag,
            expected: "i32",
            actual: value.kind(),
        })
    }

    /// Typed lookup of the first `i64` element.
    pub fn i64(&self, tag: Tag) -> Result<i64, MetadataError> {
        let value = self.get(tag).ok_or(MetadataError::Missing(tag))?;
        value.as_i64().ok_or(MetadataError::TypeMismatch {
            tag,
            expected: "i64",
            actual: value.kind(),
        })
    }

    /// Copy every entry of `other` over `self`.
    pub fn merge(&mut self, other: &Settings) {
        for (tag, value) in other.iter() {
            self.entries.insert(tag, value.clone());
        }
    }

    /// Subset of entries whose tags appear in `keys`.
    pub fn filtered(&self, keys: &[Tag]) -> Settings {
        let entries = self
            .entries
            .iter()
            .filter(|(tag, _)| keys.contains(tag))
            .map(|(tag, value)| (*tag, value.clone()))
            .collect();
        Settings { entries }
    }

    /// Keys from `keys` whose value differs between `self` and `other`, including keys
    /// present in only one side.
    ///
    /// # Example
    /// ```rust
    /// use aperture_core::prelude::{MetadataValue, Settings, tags};
    ///
    /// let old = Settings::new().with(tags::CONTROL_AE_MODE, MetadataValue::u8(1));
    /// let new = Settings::new().with(tags::CONTROL_AE_MODE, MetadataValue::u8(0));
    /// let changed = old.changed_keys(&new, &[tags::CONTROL_AE_MODE, tags::SENSOR_EXPOSURE_TIME]);
    /// assert_eq!(changed, vec![tags::CONTROL_AE_MODE]);
    /// ```
    pub fn changed_keys(&self, other: &Settings, keys: &[Tag]) -> Vec<Tag> {
        keys.iter()
            .copied()
            .filter(|tag| self.get(*tag) != other.get(*tag))
            .collect()
    }
}

impl FromIterator<(Tag, MetadataValue)> for Settings {
    fn from_iter<I: IntoIterator<Item = (Tag, MetadataValue)>>(iter: I) -> Self {
        Settings {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Well-known tags and enumerated values understood by the pipeline.
pub mod tags {
    use super::Tag;

    const CONTROL: u32 = 0x0001_0000;
    const REQUEST: u32 = 0x000e_0000;
    const SCALER: u32 = 0x000d_0000;
    const SENSOR: u32 = 0x000f_0000;

    pub const CONTROL_AE_MODE: Tag = Tag::new(CONTROL | 0x02);
    pub const CONTROL_AE_PRECAPTURE_TRIGGER: Tag = Tag::new(CONTROL | 0x04);
    pub const CONTROL_AE_TARGET_FPS_RANGE: Tag = Tag::new(CONTROL | 0x05);
    pub const CONTROL_AF_TRIGGER: Tag = Tag::new(CONTROL | 0x08);
    pub const CONTROL_CAPTURE_INTENT: Tag = Tag::new(CONTROL | 0x0a);
    pub const CONTROL_AF_TRIGGER_ID: Tag = Tag::new(CONTROL | 0x20);
    pub const CONTROL_AE_PRECAPTURE_ID: Tag = Tag::new(CONTROL | 0x21);
    pub const CONTROL_ENABLE_ZSL: Tag = Tag::new(CONTROL | 0x29);
    pub const CONTROL_ZOOM_RATIO: Tag = Tag::new(CONTROL | 0x2b);
    pub const REQUEST_ID: Tag = Tag::new(REQUEST | 0x01);
    pub const REQUEST_FRAME_COUNT: Tag = Tag::new(REQUEST | 0x02);
    pub const SCALER_ROTATE_AND_CROP: Tag = Tag::new(SCALER | 0x10);
    pub const SENSOR_EXPOSURE_TIME: Tag = Tag::new(SENSOR | 0x01);
    pub const SENSOR_FRAME_DURATION: Tag = Tag::new(SENSOR | 0x02);
    pub const SENSOR_TIMESTAMP: Tag = Tag::new(SENSOR | 0x10);

    const NAMES: &[(Tag, &str)] = &[
        (CONTROL_AE_MODE, "control.aeMode"),
        (CONTROL_AE_PRECAPTURE_TRIGGER, "control.aePrecaptureTrigger"),
        (CONTROL_AE_TARGET_FPS_RANGE, "control.aeTargetFpsRange"),
        (CONTROL_AF_TRIGGER, "control.afTrigger"),
        (CONTROL_CAPTURE_INTENT, "control.captureIntent"),
        (CONTROL_AF_TRIGGER_ID, "control.afTriggerId"),
        (CONTROL_AE_PRECAPTURE_ID, "control.aePrecaptureId"),
        (CONTROL_ENABLE_ZSL, "control.enableZsl"),
        (CONTROL_ZOOM_RATIO, "control.zoomRatio"),
        (REQUEST_ID, "request.id"),
        (REQUEST_FRAME_COUNT, "request.frameCount"),
        (SCALER_ROTATE_AND_CROP, "scaler.rotateAndCrop"),
        (SENSOR_EXPOSURE_TIME, "sensor.exposureTime"),
        (SENSOR_FRAME_DURATION, "sensor.frameDuration"),
        (SENSOR_TIMESTAMP, "sensor.timestamp"),
    ];

    /// Human-readable name for a well-known tag.
    pub fn name(tag: Tag) -> Option<&'static str> {
        NAMES.iter().find(|(t, _)| *t == tag).map(|(_, n)| *n)
    }

    pub mod af_trigger {
        pub const IDLE: u8 = 0;
        pub const START: u8 = 1;
        pub const CANCEL: u8 = 2;
    }

    pub mod ae_precapture_trigger {
        pub const IDLE: u8 = 0;
        pub const START: u8 = 1;
        pub const CANCEL: u8 = 2;
    }

    pub mod ae_mode {
        pub const OFF: u8 = 0;
        pub const ON: u8 = 1;
    }

    pub mod capture_intent {
        pub const CUSTOM: u8 = 0;
        pub const PREVIEW: u8 = 1;
        pub const STILL_CAPTURE: u8 = 2;
        pub const VIDEO_RECORD: u8 = 3;
    }

    pub mod rotate_and_crop {
        pub const NONE: u8 = 0;
        pub const ROTATE_90: u8 = 1;
        pub const ROTATE_180: u8 = 2;
        pub const ROTATE_270: u8 = 3;
        pub const AUTO: u8 = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup_reports_mismatch() {
        let settings = Settings::new().with(tags::CONTROL_AE_MODE, MetadataValue::f32(1.0));
        let err = settings.i32(tags::CONTROL_AE_MODE).expect_err("float is not i32");
        assert_eq!(err.code(), "metadata_type_mismatch");
        assert_eq!(
            settings.i32(tags::REQUEST_ID).expect_err("missing"),
            MetadataError::Missing(tags::REQUEST_ID)
        );
    }

    #[test]
    fn changed_keys_covers_removed_entries() {
        let old = Settings::new()
            .with(tags::CONTROL_AE_TARGET_FPS_RANGE, MetadataValue::i32s(&[15, 30]))
            .with(tags::CONTROL_ZOOM_RATIO, MetadataValue::f32(1.0));
        let new =
            Settings::new().with(tags::CONTROL_AE_TARGET_FPS_RANGE, MetadataValue::i32s(&[15, 30]));
        let keys = [tags::CONTROL_AE_TARGET_FPS_RANGE, tags::CONTROL_ZOOM_RATIO];
        assert_eq!(old.changed_keys(&new, &keys), vec![tags::CONTROL_ZOOM_RATIO]);
        assert!(old.changed_keys(&old.clone(), &keys).is_empty());
    }

    #[test]
    fn filtered_keeps_only_requested_tags() {
        let settings = Settings::new()
            .with(tags::REQUEST_ID, MetadataValue::i32(3))
            .with(tags::CONTROL_AE_MODE, MetadataValue::u8(tags::ae_mode::ON));
        let filtered = settings.filtered(&[tags::CONTROL_AE_MODE]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get(tags::CONTROL_AE_MODE), Some(&MetadataValue::u8(1)));
    }

    #[test]
    fn unknown_tags_display_as_hex() {
        assert_eq!(Tag::new(0xdead_0001).to_string(), "0xdead0001");
        assert_eq!(Tag::new(0xdead_0001).section(), 0xdead);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn settings_survive_json() {
        let settings = Settings::new()
            .with(tags::REQUEST_ID, MetadataValue::i32(4))
            .with(tags::CONTROL_ZOOM_RATIO, MetadataValue::f32(2.0));
        let json = serde_json::to_string(&settings).expect("serialize");
        let back: Settings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, settings);
    }
}
