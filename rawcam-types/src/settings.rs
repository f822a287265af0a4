use serde::{Deserialize, Serialize};

/// Tuning values applied by the offline processor.
///
/// Serialized into the bundle manifest under `postProcessingSettings`.
/// Missing keys take the defaults below; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostProcessSettings {
    /// Multiplier on the wavelet shrinkage threshold.
    pub spatial_denoise_aggressiveness: f32,

    /// White balance override. Negative means use the as-shot neutral.
    pub temperature: f32,
    pub tint: f32,

    pub chroma_eps: f32,

    pub gamma: f32,
    pub tonemap_variance: f32,
    pub shadows: f32,
    pub white_point: f32,
    pub contrast: f32,
    pub sharpen0: f32,
    pub sharpen1: f32,
    pub blacks: f32,
    pub exposure: f32,

    pub noise_sigma: f32,
    pub scene_luminance: f32,

    pub saturation: f32,
    pub blue_saturation: f32,
    pub green_saturation: f32,

    pub jpeg_quality: i32,
    pub flipped: bool,
    pub dng: bool,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            spatial_denoise_aggressiveness: 1.0,
            temperature: -1.0,
            tint: -1.0,
            chroma_eps: 0.0,
            gamma: 2.2,
            tonemap_variance: 0.25,
            shadows: 1.0,
            white_point: 1.0,
            contrast: 0.5,
            sharpen0: 4.0,
            sharpen1: 3.0,
            blacks: 0.0,
            exposure: 0.0,
            noise_sigma: 0.0,
            scene_luminance: 0.0,
            saturation: 1.0,
            blue_saturation: 1.0,
            green_saturation: 1.0,
            jpeg_quality: 95,
            flipped: false,
            dng: false,
        }
    }
}

impl PostProcessSettings {
    pub fn from_json(json: &serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(json.clone())?)
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Serialization of this struct cannot fail.
        serde_json::to_value(self).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_for_missing_keys() {
        let json: serde_json::Value = serde_json::from_str(r#"{"shadows": 4.0}"#).unwrap();
        let s = PostProcessSettings::from_json(&json).unwrap();
        assert_eq!(s.shadows, 4.0);
        assert_eq!(s.gamma, 2.2);
        assert_eq!(s.jpeg_quality, 95);
    }

    #[test]
    fn unknown_keys_ignored() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"notARealKey": 1, "contrast": 0.25}"#).unwrap();
        let s = PostProcessSettings::from_json(&json).unwrap();
        assert_eq!(s.contrast, 0.25);
    }

    #[test]
    fn json_round_trip() {
        let mut s = PostProcessSettings::default();
        s.temperature = 5500.0;
        s.tint = 12.0;
        s.dng = true;
        let back = PostProcessSettings::from_json(&s.to_json()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn camel_case_key_names() {
        let v = PostProcessSettings::default().to_json();
        let obj = v.as_object().unwrap();
        assert!(obj.contains_key("spatialDenoiseAggressiveness"));
        assert!(obj.contains_key("whitePoint"));
        assert!(obj.contains_key("blueSaturation"));
        assert!(obj.contains_key("jpegQuality"));
    }
}
