//! Media constraint builder
//!
//! Turns the flat key/value parameters of a publish link (usually its query
//! string) into a [`MediaConstraints`] descriptor for the capture backend and
//! the [`PublishSettings`] used by the negotiator.
//!
//! Recognised keys:
//!
//! | key | effect |
//! |---|---|
//! | `fm` | video `facingMode` |
//! | `a` | video `aspectRatio`, `N_D` is computed as N/D |
//! | `r`, `h`, `w` | video `frameRate`, `height`, `width` |
//! | `ve`, `ae` | falsy disables video / audio |
//! | `br` | target bitrate in kbps |
//! | `gdm` | start in display capture mode |
//! | `vs.*` `vf.*` `vb.*` | raw video attribute as text / number / flag |
//! | `as.*` `af.*` `ab.*` | raw audio attribute as text / number / flag |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Default target bitrate in kbps when `br` is not given.
pub const DEFAULT_BITRATE_KBPS: f64 = 3500.0;

/// Facing mode requested when `fm` is not given.
pub const DEFAULT_FACING_MODE: &str = "environment";

/// A single capture attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ConstraintValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConstraintValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstraintValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConstraintValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

/// Open attribute map for one kind of track.
pub type TrackConstraints = BTreeMap<String, ConstraintValue>;

/// Capture descriptor. `None` means the kind is disabled and nothing about it
/// reaches the capture backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(serialize_with = "track_or_false", deserialize_with = "track_or_bool")]
    pub audio: Option<TrackConstraints>,
    #[serde(serialize_with = "track_or_false", deserialize_with = "track_or_bool")]
    pub video: Option<TrackConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        let mut video = TrackConstraints::new();
        video.insert(
            "facingMode".to_string(),
            ConstraintValue::Text(DEFAULT_FACING_MODE.to_string()),
        );
        Self {
            audio: Some(TrackConstraints::new()),
            video: Some(video),
        }
    }
}

impl MediaConstraints {
    pub fn audio_enabled(&self) -> bool {
        self.audio.is_some()
    }

    pub fn video_enabled(&self) -> bool {
        self.video.is_some()
    }

    pub fn video_attr(&self, name: &str) -> Option<&ConstraintValue> {
        self.video.as_ref().and_then(|v| v.get(name))
    }

    pub fn audio_attr(&self, name: &str) -> Option<&ConstraintValue> {
        self.audio.as_ref().and_then(|a| a.get(name))
    }

    /// Render in the capture-API shape, `{"audio": {..} | false, "video": {..} | false}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn track_or_false<S>(track: &Option<TrackConstraints>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match track {
        Some(attrs) => attrs.serialize(serializer),
        None => serializer.serialize_bool(false),
    }
}

fn track_or_bool<'de, D>(deserializer: D) -> Result<Option<TrackConstraints>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Enabled(bool),
        Attrs(TrackConstraints),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Enabled(true) => Some(TrackConstraints::new()),
        Repr::Enabled(false) => None,
        Repr::Attrs(attrs) => Some(attrs),
    })
}

/// Settings that steer the publish attempt rather than the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PublishSettings {
    pub target_bitrate_kbps: f64,
    /// Initial capture mode only; the controller owns it afterwards.
    pub use_display_capture: bool,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            target_bitrate_kbps: DEFAULT_BITRATE_KBPS,
            use_display_capture: false,
        }
    }
}

/// `"1"` and `"true"` are true. Everything else, the empty string included, is false.
pub fn parse_bool(value: &str) -> bool {
    value == "1" || value == "true"
}

/// Lenient float parse: the longest leading decimal literal wins, otherwise NaN.
///
/// `"30fps"` gives 30, `" 1.5"` gives 1.5, `"abc"` gives NaN.
pub fn parse_float(value: &str) -> f64 {
    let s = value.trim_start();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'-') => (-1.0, &s[1..]),
        Some(b'+') => (1.0, &s[1..]),
        _ => (1.0, s),
    };

    if rest.starts_with("Infinity") {
        return sign * f64::INFINITY;
    }

    let bytes = rest.as_bytes();
    let mut end = 0;
    let mut digits = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        digits += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return f64::NAN;
    }

    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    rest[..end]
        .parse::<f64>()
        .map(|v| sign * v)
        .unwrap_or(f64::NAN)
}

/// `"16_9"` gives 16/9, anything else is a plain float.
pub fn parse_aspect_ratio(value: &str) -> f64 {
    if value.contains('_') {
        let mut parts = value.split('_');
        let numerator = parse_float(parts.next().unwrap_or(""));
        let denominator = parse_float(parts.next().unwrap_or(""));
        numerator / denominator
    } else {
        parse_float(value)
    }
}

/// Build constraints and settings from key/value pairs.
///
/// Named keys read their first occurrence. Prefixed keys are applied in
/// input order, so later duplicates win. `ve`/`ae` run last.
pub fn build_constraints<I, K, V>(params: I) -> (MediaConstraints, PublishSettings)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let params: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    let first = |key: &str| first_value(&params, key);

    let mut constraints = MediaConstraints::default();
    let mut settings = PublishSettings::default();
    let mut video = constraints.video.take().unwrap_or_default();
    let mut audio = constraints.audio.take().unwrap_or_default();

    if let Some(fm) = first("fm") {
        video.insert("facingMode".to_string(), ConstraintValue::Text(fm.to_string()));
    }
    if let Some(a) = first("a") {
        video.insert(
            "aspectRatio".to_string(),
            ConstraintValue::Number(parse_aspect_ratio(a)),
        );
    }
    for (key, attr) in [("r", "frameRate"), ("h", "height"), ("w", "width")] {
        if let Some(v) = first(key) {
            video.insert(attr.to_string(), ConstraintValue::Number(parse_float(v)));
        }
    }

    for (key, value) in &params {
        let Some((prefix, name)) = key.split_once('.') else {
            continue;
        };
        let (target, parsed) = match prefix {
            "vs" => (&mut video, ConstraintValue::Text(value.clone())),
            "vf" => (&mut video, ConstraintValue::Number(parse_float(value))),
            "vb" => (&mut video, ConstraintValue::Flag(parse_bool(value))),
            "as" => (&mut audio, ConstraintValue::Text(value.clone())),
            "af" => (&mut audio, ConstraintValue::Number(parse_float(value))),
            "ab" => (&mut audio, ConstraintValue::Flag(parse_bool(value))),
            _ => continue,
        };
        target.insert(name.to_string(), parsed);
    }

    constraints.video = match first("ve") {
        Some(ve) if !parse_bool(ve) => None,
        _ => Some(video),
    };
    constraints.audio = match first("ae") {
        Some(ae) if !parse_bool(ae) => None,
        _ => Some(audio),
    };

    if let Some(br) = first("br") {
        settings.target_bitrate_kbps = parse_float(br);
    }
    if let Some(gdm) = first("gdm") {
        settings.use_display_capture = parse_bool(gdm);
    }

    log::debug!(
        "Built media constraints {} (bitrate {} kbps, display capture {})",
        constraints.to_json(),
        settings.target_bitrate_kbps,
        settings.use_display_capture
    );

    (constraints, settings)
}

fn first_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Build from a URL query string, with or without the leading `?`.
pub fn from_query_string(query: &str) -> (MediaConstraints, PublishSettings) {
    let query = query.strip_prefix('?').unwrap_or(query);
    build_constraints(url::form_urlencoded::parse(query.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_parameters() {
        let (constraints, settings) = build_constraints(Vec::<(&str, &str)>::new());
        assert!(constraints.audio_enabled());
        assert_eq!(
            constraints.video_attr("facingMode"),
            Some(&ConstraintValue::Text("environment".to_string()))
        );
        assert_eq!(settings.target_bitrate_kbps, 3500.0);
        assert!(!settings.use_display_capture);
    }

    #[test]
    fn test_parse_bool_literals() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        for falsy in ["0", "false", "", "yes", "TRUE", "True", " 1"] {
            assert!(!parse_bool(falsy), "{falsy:?} should be false");
        }
    }

    #[test]
    fn test_parse_float_prefix_rules() {
        assert_eq!(parse_float("1.5"), 1.5);
        assert_eq!(parse_float("30fps"), 30.0);
        assert_eq!(parse_float("  42"), 42.0);
        assert_eq!(parse_float("-2.5e2x"), -250.0);
        assert_eq!(parse_float(".5"), 0.5);
        assert_eq!(parse_float("1e"), 1.0);
        assert_eq!(parse_float("Infinity"), f64::INFINITY);
        assert!(parse_float("abc").is_nan());
        assert!(parse_float("").is_nan());
        assert!(parse_float(".").is_nan());
    }

    #[test]
    fn test_aspect_ratio_forms() {
        assert!((parse_aspect_ratio("16_9") - 16.0 / 9.0).abs() < 1e-12);
        assert_eq!(parse_aspect_ratio("1.5"), 1.5);
        assert_eq!(parse_aspect_ratio("4_3_2"), 4.0 / 3.0);
        assert!(parse_aspect_ratio("x_9").is_nan());
    }

    #[test]
    fn test_named_video_keys() {
        let (c, _) = build_constraints([("fm", "user"), ("r", "30"), ("h", "720"), ("w", "1280")]);
        assert_eq!(c.video_attr("facingMode").and_then(|v| v.as_str()), Some("user"));
        assert_eq!(c.video_attr("frameRate").and_then(|v| v.as_f64()), Some(30.0));
        assert_eq!(c.video_attr("height").and_then(|v| v.as_f64()), Some(720.0));
        assert_eq!(c.video_attr("width").and_then(|v| v.as_f64()), Some(1280.0));
    }

    #[test]
    fn test_prefixed_keys_overwrite_in_order() {
        let (c, _) = build_constraints([
            ("w", "640"),
            ("vf.width", "800"),
            ("vs.deviceId", "cam-1"),
            ("vs.deviceId", "cam-2"),
            ("ab.echoCancellation", "true"),
            ("af.sampleRate", "48000"),
            ("as.deviceId", "mic"),
        ]);
        assert_eq!(c.video_attr("width").and_then(|v| v.as_f64()), Some(800.0));
        assert_eq!(c.video_attr("deviceId").and_then(|v| v.as_str()), Some("cam-2"));
        assert_eq!(
            c.audio_attr("echoCancellation").and_then(|v| v.as_bool()),
            Some(true)
        );
        assert_eq!(c.audio_attr("sampleRate").and_then(|v| v.as_f64()), Some(48000.0));
        assert_eq!(c.audio_attr("deviceId").and_then(|v| v.as_str()), Some("mic"));
    }

    #[test]
    fn test_disable_wins_regardless_of_order() {
        let (c, _) = build_constraints([
            ("ve", "0"),
            ("vs.deviceId", "cam"),
            ("ae", "no"),
            ("af.sampleRate", "44100"),
        ]);
        assert!(c.video.is_none());
        assert!(c.audio.is_none());
    }

    #[test]
    fn test_truthy_enable_flags_keep_descriptors() {
        let (c, _) = build_constraints([("ve", "1"), ("ae", "true")]);
        assert!(c.video_enabled());
        assert!(c.audio_enabled());
    }

    #[test]
    fn test_invalid_numbers_become_nan() {
        let (c, s) = build_constraints([("r", "fast"), ("br", "lots")]);
        assert!(c.video_attr("frameRate").and_then(|v| v.as_f64()).unwrap().is_nan());
        assert!(s.target_bitrate_kbps.is_nan());
    }

    #[test]
    fn test_query_string_end_to_end() {
        let (c, s) = from_query_string("?fm=user&a=16_9&br=1000&ve=1&gdm=true");
        assert_eq!(c.video_attr("facingMode").and_then(|v| v.as_str()), Some("user"));
        let ar = c.video_attr("aspectRatio").and_then(|v| v.as_f64()).unwrap();
        assert!((ar - 1.7778).abs() < 1e-3);
        assert_eq!(s.target_bitrate_kbps, 1000.0);
        assert!(s.use_display_capture);

        let (c, _) = from_query_string("fm=user&a=16_9&br=1000&ve=0");
        assert!(c.video.is_none());
        assert!(c.audio_enabled());
    }

    #[test]
    fn test_json_shape_uses_false_for_disabled() {
        let (c, _) = build_constraints([("ve", "0")]);
        let json = c.to_json();
        assert_eq!(json["video"], serde_json::Value::Bool(false));
        assert!(json["audio"].is_object());

        let back: MediaConstraints = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
