//! Codec string bookkeeping for `CODECS` attributes.

/// Media category of a codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    Audio,
    Video,
    Text,
}

// ISO/IEC 14496-12 sample entry codes
const AUDIO_SAMPLE_ENTRIES: &[&str] = &[
    "a3ds", "ac-3", "ac-4", "alac", "alaw", "dra1", "dts+", "dts-", "dtsc", "dtse", "dtsh",
    "ec-3", "enca", "fLaC", "g719", "g726", "m4ae", "mha1", "mha2", "mhm1", "mhm2", "mlpa",
    "mp4a", "raw ", "Opus", "opus", "samr", "sawb", "sawp", "sevc", "sqcp", "ssmv", "twos",
    "ulaw",
];

const VIDEO_SAMPLE_ENTRIES: &[&str] = &[
    "avc1", "avc2", "avc3", "avc4", "avcp", "av01", "drac", "dva1", "dvav", "dvh1", "dvhe",
    "encv", "hev1", "hvc1", "mjp2", "mp4v", "mvc1", "mvc2", "mvc3", "mvc4", "resv", "rv60",
    "s263", "svc1", "svc2", "vc-1", "vp08", "vp09",
];

const TEXT_SAMPLE_ENTRIES: &[&str] = &["stpp", "wvtt"];

/// Whether the first four characters of `codec` name a sample entry of `kind`.
pub fn is_codec_type(codec: &str, kind: CodecType) -> bool {
    let fourcc: String = codec.chars().take(4).collect();
    let table = match kind {
        CodecType::Audio => AUDIO_SAMPLE_ENTRIES,
        CodecType::Video => VIDEO_SAMPLE_ENTRIES,
        CodecType::Text => TEXT_SAMPLE_ENTRIES,
    };
    table.contains(&fourcc.as_str())
}

/// Codecs of a variant split by media type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelCodecs {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub text_codec: Option<String>,
    pub unknown_codecs: Vec<String>,
}

impl LevelCodecs {
    pub fn classify(codecs: &str) -> Self {
        let mut remaining: Vec<&str> = codecs
            .split(|c| c == ' ' || c == ',')
            .filter(|c| !c.is_empty())
            .collect();
        let mut out = LevelCodecs::default();

        for kind in [CodecType::Video, CodecType::Audio, CodecType::Text] {
            let (matching, rest): (Vec<&str>, Vec<&str>) =
                remaining.into_iter().partition(|c| is_codec_type(c, kind));
            remaining = rest;
            if matching.is_empty() {
                continue;
            }
            let joined = matching
                .iter()
                .map(|c| c.split('/').next().unwrap_or(c))
                .collect::<Vec<_>>()
                .join(",");
            match kind {
                CodecType::Video => out.video_codec = Some(joined),
                CodecType::Audio => out.audio_codec = Some(joined),
                CodecType::Text => out.text_codec = Some(joined),
            }
        }

        out.unknown_codecs = remaining.into_iter().map(String::from).collect();
        out
    }

    pub fn has_known(&self) -> bool {
        self.video_codec.is_some() || self.audio_codec.is_some() || self.text_codec.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_av() {
        let c = LevelCodecs::classify("avc1.4d401f,mp4a.40.2");
        assert_eq!(c.video_codec.as_deref(), Some("avc1.4d401f"));
        assert_eq!(c.audio_codec.as_deref(), Some("mp4a.40.2"));
        assert!(c.text_codec.is_none());
        assert!(c.unknown_codecs.is_empty());
    }

    #[test]
    fn classify_unknown() {
        let c = LevelCodecs::classify("xyz1.2, wvtt");
        assert_eq!(c.text_codec.as_deref(), Some("wvtt"));
        assert_eq!(c.unknown_codecs, vec!["xyz1.2".to_string()]);
        assert!(c.has_known());
        assert!(!LevelCodecs::classify("").has_known());
    }

    #[test]
    fn codec_types() {
        assert!(is_codec_type("hvc1.1.6.L93.90", CodecType::Video));
        assert!(is_codec_type("ec-3", CodecType::Audio));
        assert!(!is_codec_type("ec-3", CodecType::Video));
    }
}
