use std::collections::HashMap;

/// Attribute families stored in `job_details.opt_type`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum OptionType {
    ShotType,
    Background,
    Lighting,
    Expression,
    Mood,
    Prompt,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Key/value pairs of one option type, in insertion order.
///
/// A repeated key keeps its first position and takes the latest value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionGroup {
    entries: Vec<(String, String)>,
}

impl OptionGroup {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OptionGroup {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut group = Self::default();
        for (k, v) in iter {
            group.insert(k, v);
        }
        group
    }
}

/// All detail rows of one job grouped by `opt_type`.
///
/// Types are kept as raw strings so rows with a type this build does not
/// know about are carried along rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct JobDetails {
    groups: HashMap<String, OptionGroup>,
}

impl JobDetails {
    pub fn push(&mut self, opt_type: &str, key: impl Into<String>, value: impl Into<String>) {
        self.groups
            .entry(opt_type.to_string())
            .or_default()
            .insert(key, value);
    }

    pub fn group(&self, opt_type: OptionType) -> Option<&OptionGroup> {
        self.groups.get(opt_type.as_str())
    }

    /// Value of `key` within `opt_type`, if present.
    pub fn value(&self, opt_type: OptionType, key: &str) -> Option<&str> {
        self.group(opt_type).and_then(|g| g.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Flattened option set consumed by the prompt builder.
///
/// Scalar options come from the detail whose key equals its type (e.g.
/// `expression/expression`). Background keeps the whole group so that the
/// monotone colour rule can see both `type` and `color`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleOptions {
    pub shot_type: Option<String>,
    pub expression: Option<String>,
    pub lighting: Option<String>,
    pub mood: Option<String>,
    pub background: OptionGroup,
}

impl StyleOptions {
    pub fn from_details(details: &JobDetails) -> Self {
        let scalar = |opt_type: OptionType| {
            details
                .value(opt_type, opt_type.as_str())
                .map(str::to_owned)
        };

        Self {
            shot_type: scalar(OptionType::ShotType),
            expression: scalar(OptionType::Expression),
            lighting: scalar(OptionType::Lighting),
            mood: scalar(OptionType::Mood),
            background: details
                .group(OptionType::Background)
                .cloned()
                .unwrap_or_default(),
        }
    }
}
