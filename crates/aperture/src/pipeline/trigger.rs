use std::collections::BTreeMap;

use aperture_core::prelude::*;

use super::request::ResultExtras;

/// A one-shot settings override mixed into exactly the next submitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub tag: Tag,
    pub value: MetadataValue,
}

impl Trigger {
    pub fn new(tag: Tag, value: MetadataValue) -> Self {
        Self { tag, value }
    }

    pub fn autofocus(id: i32) -> [Trigger; 2] {
        [
            Self::new(tags::CONTROL_AF_TRIGGER, MetadataValue::u8(tags::af_trigger::START)),
            Self::new(tags::CONTROL_AF_TRIGGER_ID, MetadataValue::i32(id)),
        ]
    }

    pub fn cancel_autofocus(id: i32) -> [Trigger; 2] {
        [
            Self::new(tags::CONTROL_AF_TRIGGER, MetadataValue::u8(tags::af_trigger::CANCEL)),
            Self::new(tags::CONTROL_AF_TRIGGER_ID, MetadataValue::i32(id)),
        ]
    }

    pub fn precapture_metering(id: i32) -> [Trigger; 2] {
        [
            Self::new(
                tags::CONTROL_AE_PRECAPTURE_TRIGGER,
                MetadataValue::u8(tags::ae_precapture_trigger::START),
            ),
            Self::new(tags::CONTROL_AE_PRECAPTURE_ID, MetadataValue::i32(id)),
        ]
    }

    fn is_id(&self) -> bool {
        self.tag == tags::CONTROL_AF_TRIGGER_ID || self.tag == tags::CONTROL_AE_PRECAPTURE_ID
    }
}

/// Trigger ids most recently mixed in; carried by every later frame's extras.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TriggerIds {
    pub af: i32,
    pub precapture: i32,
}

impl TriggerIds {
    pub fn stamp(&self, extras: &mut ResultExtras) {
        extras.af_trigger_id = self.af;
        extras.precapture_trigger_id = self.precapture;
    }
}

/// Queued triggers keyed by tag; a later trigger for the same tag replaces the earlier one.
#[derive(Debug, Default)]
pub(crate) struct TriggerMap {
    entries: BTreeMap<Tag, MetadataValue>,
}

impl TriggerMap {
    pub fn queue(&mut self, triggers: impl IntoIterator<Item = Trigger>) {
        for trigger in triggers {
            self.entries.insert(trigger.tag, trigger.value);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Move every queued trigger into `settings`. Id triggers update `ids` instead of the
    /// settings. Returns how many triggers were consumed.
    pub fn mix_into(&mut self, settings: &mut Settings, ids: &mut TriggerIds) -> usize {
        let count = self.entries.len();
        for (tag, value) in std::mem::take(&mut self.entries) {
            let trigger = Trigger { tag, value };
            if trigger.is_id() {
                let id = trigger.value.as_i32().unwrap_or(0);
                if trigger.tag == tags::CONTROL_AF_TRIGGER_ID {
                    ids.af = id;
                } else {
                    ids.precapture = id;
                }
                continue;
            }
            settings.set(trigger.tag, trigger.value);
        }
        count
    }
}

/// Trigger id 0 is reserved, so synthesized ids use 1.
const PLACEHOLDER_TRIGGER_ID: i32 = 1;

/// Insert placeholder ids for active triggers lacking one.
pub(crate) fn add_placeholder_trigger_ids(settings: &mut Settings) {
    let pairs = [
        (
            tags::CONTROL_AF_TRIGGER,
            tags::af_trigger::IDLE,
            tags::CONTROL_AF_TRIGGER_ID,
        ),
        (
            tags::CONTROL_AE_PRECAPTURE_TRIGGER,
            tags::ae_precapture_trigger::IDLE,
            tags::CONTROL_AE_PRECAPTURE_ID,
        ),
    ];
    for (trigger, idle, id) in pairs {
        let active = settings
            .get(trigger)
            .and_then(MetadataValue::as_u8)
            .is_some_and(|v| v != idle);
        if active && !settings.contains(id) {
            settings.set(id, MetadataValue::i32(PLACEHOLDER_TRIGGER_ID));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_trigger_replaces_earlier_one() {
        let mut map = TriggerMap::default();
        map.queue(Trigger::autofocus(3));
        map.queue(Trigger::cancel_autofocus(4));
        assert_eq!(map.len(), 2);
        let mut settings = Settings::new();
        let mut ids = TriggerIds::default();
        assert_eq!(map.mix_into(&mut settings, &mut ids), 2);
        assert_eq!(
            settings.get(tags::CONTROL_AF_TRIGGER),
            Some(&MetadataValue::u8(tags::af_trigger::CANCEL))
        );
        assert!(!settings.contains(tags::CONTROL_AF_TRIGGER_ID));
        assert_eq!(ids, TriggerIds { af: 4, precapture: 0 });
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn placeholder_ids_only_for_active_triggers() {
        let mut settings = Settings::new()
            .with(tags::CONTROL_AF_TRIGGER, MetadataValue::u8(tags::af_trigger::START))
            .with(
                tags::CONTROL_AE_PRECAPTURE_TRIGGER,
                MetadataValue::u8(tags::ae_precapture_trigger::IDLE),
            );
        add_placeholder_trigger_ids(&mut settings);
        assert_eq!(settings.i32(tags::CONTROL_AF_TRIGGER_ID).expect("af id"), 1);
        assert!(!settings.contains(tags::CONTROL_AE_PRECAPTURE_ID));

        let mut explicit = Settings::new()
            .with(tags::CONTROL_AF_TRIGGER, MetadataValue::u8(tags::af_trigger::START))
            .with(tags::CONTROL_AF_TRIGGER_ID, MetadataValue::i32(9));
        add_placeholder_trigger_ids(&mut explicit);
        assert_eq!(explicit.i32(tags::CONTROL_AF_TRIGGER_ID).expect("af id"), 9);
    }

    #[test]
    fn ids_stamp_extras() {
        let mut extras = ResultExtras::default();
        TriggerIds { af: 2, precapture: 5 }.stamp(&mut extras);
        assert_eq!((extras.af_trigger_id, extras.precapture_trigger_id), (2, 5));
    }
}
