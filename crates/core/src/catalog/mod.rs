//! Operation catalog: validates edit requests and maps them onto filter
//! graphs plus the capped output profile. Pure; no I/O.

pub mod graph;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::OutputConfig;
use crate::error::{EditError, EngineError};
use crate::probe::MediaInfo;
use graph::{escape_drawtext_text, num, Filter, FilterChain, FilterGraph};

/// Length of the audio fade applied by `fadeIn` / `fadeOut`.
pub const FADE_SECONDS: f64 = 3.0;
pub const MAX_TEXT_CHARS: usize = 500;
pub const MAX_FONT_SIZE: u32 = 400;
pub const MAX_VOLUME: f64 = 10.0;
pub const DEFAULT_FONT_SIZE: u32 = 24;
pub const DEFAULT_FONT_COLOR: &str = "white";
pub const DEFAULT_TEXT_X: &str = "(w-text_w)/2";
pub const DEFAULT_TEXT_Y: &str = "(h-text_h)/2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedFilter {
    Grayscale,
    Sepia,
    Blur,
    Sharpen,
    Brightness,
    Contrast,
    Saturate,
    Vignette,
    Vintage,
    Negative,
    Mirror,
    Emboss,
}

impl NamedFilter {
    pub const ALL: [NamedFilter; 12] = [
        NamedFilter::Grayscale,
        NamedFilter::Sepia,
        NamedFilter::Blur,
        NamedFilter::Sharpen,
        NamedFilter::Brightness,
        NamedFilter::Contrast,
        NamedFilter::Saturate,
        NamedFilter::Vignette,
        NamedFilter::Vintage,
        NamedFilter::Negative,
        NamedFilter::Mirror,
        NamedFilter::Emboss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NamedFilter::Grayscale => "grayscale",
            NamedFilter::Sepia => "sepia",
            NamedFilter::Blur => "blur",
            NamedFilter::Sharpen => "sharpen",
            NamedFilter::Brightness => "brightness",
            NamedFilter::Contrast => "contrast",
            NamedFilter::Saturate => "saturate",
            NamedFilter::Vignette => "vignette",
            NamedFilter::Vintage => "vintage",
            NamedFilter::Negative => "negative",
            NamedFilter::Mirror => "mirror",
            NamedFilter::Emboss => "emboss",
        }
    }

    fn stage(&self) -> Filter {
        const EMBOSS_KERNEL: &str = "-2 -1 0 -1 1 1 0 1 2";
        match self {
            NamedFilter::Grayscale => Filter::new("hue").opt("s", 0),
            NamedFilter::Sepia => Filter::new("colorchannelmixer")
                .arg(".393")
                .arg(".769")
                .arg(".189")
                .arg("0")
                .arg(".349")
                .arg(".686")
                .arg(".168")
                .arg("0")
                .arg(".272")
                .arg(".534")
                .arg(".131"),
            NamedFilter::Blur => Filter::new("boxblur").arg(5).arg(1),
            NamedFilter::Sharpen => Filter::new("unsharp")
                .arg(5)
                .arg(5)
                .arg("1.0")
                .arg(5)
                .arg(5)
                .arg("0.0"),
            NamedFilter::Brightness => Filter::new("eq").opt("brightness", "0.1"),
            NamedFilter::Contrast => Filter::new("eq").opt("contrast", "1.3"),
            NamedFilter::Saturate => Filter::new("eq").opt("saturation", "1.5"),
            NamedFilter::Vignette => Filter::new("vignette").arg("PI/4"),
            NamedFilter::Vintage => Filter::new("curves").opt("preset", "vintage"),
            NamedFilter::Negative => Filter::new("negate"),
            NamedFilter::Mirror => Filter::new("hflip"),
            NamedFilter::Emboss => Filter::new("convolution")
                .arg(EMBOSS_KERNEL)
                .arg(EMBOSS_KERNEL)
                .arg(EMBOSS_KERNEL)
                .arg(EMBOSS_KERNEL),
        }
    }
}

impl fmt::Display for NamedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamedFilter {
    type Err = EditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        NamedFilter::ALL
            .into_iter()
            .find(|filter| filter.as_str() == wanted)
            .ok_or_else(|| EditError::validation(format!("unknown filter: {}", s.trim())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioOp {
    Mute,
    Volume(f64),
    FadeIn,
    FadeOut,
    Extract,
}

impl AudioOp {
    pub fn parse(operation: &str, volume: Option<f64>) -> Result<Self, EditError> {
        match operation.trim() {
            "mute" => Ok(AudioOp::Mute),
            "volume" => volume
                .map(AudioOp::Volume)
                .ok_or_else(|| EditError::validation("volume is required for the volume operation")),
            "fadeIn" => Ok(AudioOp::FadeIn),
            "fadeOut" => Ok(AudioOp::FadeOut),
            "extract" => Ok(AudioOp::Extract),
            other => Err(EditError::validation(format!(
                "unknown audio operation: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextOverlay {
    pub text: String,
    pub font_size: u32,
    pub font_color: String,
    pub x: String,
    pub y: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TextOverlay {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_size: DEFAULT_FONT_SIZE,
            font_color: DEFAULT_FONT_COLOR.to_string(),
            x: DEFAULT_TEXT_X.to_string(),
            y: DEFAULT_TEXT_Y.to_string(),
            start: None,
            end: None,
        }
    }

    fn validate(&self) -> Result<(), EditError> {
        if self.text.trim().is_empty() {
            return Err(EditError::validation("text is required"));
        }
        if self.text.chars().count() > MAX_TEXT_CHARS {
            return Err(EditError::validation(format!(
                "text must be at most {MAX_TEXT_CHARS} characters"
            )));
        }
        if self.font_size == 0 || self.font_size > MAX_FONT_SIZE {
            return Err(EditError::validation(format!(
                "fontSize must be between 1 and {MAX_FONT_SIZE}"
            )));
        }
        if !is_color_token(&self.font_color) {
            return Err(EditError::validation(format!(
                "invalid fontColor: {}",
                self.font_color
            )));
        }
        for (field, value) in [("x", &self.x), ("y", &self.y)] {
            if !is_position_expr(value) {
                return Err(EditError::validation(format!(
                    "invalid {field} position: {value}"
                )));
            }
        }
        for (field, value) in [("startTime", self.start), ("endTime", self.end)] {
            if let Some(t) = value {
                if !t.is_finite() || t < 0.0 {
                    return Err(EditError::validation(format!(
                        "{field} must be a non-negative number"
                    )));
                }
            }
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(EditError::validation(
                    "endTime must be greater than startTime",
                ));
            }
        }
        Ok(())
    }

    fn enable_expr(&self) -> Option<String> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(format!("between(t,{},{})", num(start), num(end))),
            (Some(start), None) => Some(format!("gte(t,{})", num(start))),
            (None, Some(end)) => Some(format!("lte(t,{})", num(end))),
            (None, None) => None,
        }
    }
}

/// Colour names, `#rrggbb`, `0xrrggbb`, with optional `@alpha`.
fn is_color_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '#' | '@' | '.'))
}

/// Numbers or drawtext position expressions over a fixed character set.
fn is_position_expr(value: &str) -> bool {
    !value.trim().is_empty()
        && value.len() <= 64
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '*' | '/' | '(' | ')' | '.' | ' ')
        })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Trim { start: f64, end: f64 },
    Filter(NamedFilter),
    Text(TextOverlay),
    Merge,
    Audio(AudioOp),
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Trim { .. } => "trim",
            Operation::Filter(_) => "filter",
            Operation::Text(_) => "text",
            Operation::Merge => "merge",
            Operation::Audio(AudioOp::Extract) => "extract-audio",
            Operation::Audio(_) => "audio",
        }
    }

    /// Operations whose graph depends on source stream layout or duration.
    pub fn needs_probe(&self) -> bool {
        matches!(
            self,
            Operation::Merge
                | Operation::Audio(
                    AudioOp::Volume(_) | AudioOp::FadeIn | AudioOp::FadeOut | AudioOp::Extract
                )
        )
    }
}

/// A validated edit: input artifact names plus the operation to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub inputs: Vec<String>,
    pub operation: Operation,
}

impl TransformRequest {
    pub fn single(input: impl Into<String>, operation: Operation) -> Self {
        Self {
            inputs: vec![input.into()],
            operation,
        }
    }

    pub fn validate(&self) -> Result<(), EditError> {
        match &self.operation {
            Operation::Merge => {
                if self.inputs.len() < 2 {
                    return Err(EditError::validation(
                        "at least two filenames are required to merge",
                    ));
                }
            }
            _ => {
                if self.inputs.len() != 1 {
                    return Err(EditError::validation("exactly one filename is required"));
                }
            }
        }
        if self.inputs.iter().any(|name| name.trim().is_empty()) {
            return Err(EditError::validation("filename is required"));
        }

        match &self.operation {
            Operation::Trim { start, end } => {
                // An end at or before the start is not an error: the output
                // duration clamps to zero.
                if !start.is_finite() || !end.is_finite() || *start < 0.0 || *end < 0.0 {
                    return Err(EditError::validation(
                        "startTime and endTime must be non-negative numbers",
                    ));
                }
            }
            Operation::Text(overlay) => overlay.validate()?,
            Operation::Audio(AudioOp::Volume(volume)) => {
                if !volume.is_finite() || *volume < 0.0 || *volume > MAX_VOLUME {
                    return Err(EditError::validation(format!(
                        "volume must be between 0 and {MAX_VOLUME}"
                    )));
                }
            }
            Operation::Filter(_) | Operation::Merge | Operation::Audio(_) => {}
        }
        Ok(())
    }
}

pub fn trim_duration(start: f64, end: f64) -> f64 {
    (end - start).max(0.0)
}

/// A resolved input: the artifact path plus its probe result when one was needed.
#[derive(Debug, Clone)]
pub struct SourceMedia {
    pub path: PathBuf,
    pub info: Option<MediaInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Video,
    VideoWithoutAudio,
    AudioOnly,
}

/// Everything the engine needs to run one transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPlan {
    pub operation: &'static str,
    pub inputs: Vec<PathBuf>,
    /// Input seek applied before the first input.
    pub seek: Option<f64>,
    /// Output duration clamp.
    pub duration: Option<f64>,
    pub video_filters: Option<FilterChain>,
    pub audio_filters: Option<FilterChain>,
    pub complex_graph: Option<FilterGraph>,
    pub maps: Vec<String>,
    pub output: OutputKind,
    pub encoding: Vec<String>,
    pub extension: &'static str,
}

impl TransformPlan {
    fn new(operation: &'static str, inputs: Vec<PathBuf>) -> Self {
        Self {
            operation,
            inputs,
            seek: None,
            duration: None,
            video_filters: None,
            audio_filters: None,
            complex_graph: None,
            maps: Vec::new(),
            output: OutputKind::Video,
            encoding: Vec::new(),
            extension: "mp4",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformCatalog {
    profile: OutputConfig,
}

impl TransformCatalog {
    pub fn new(profile: OutputConfig) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &OutputConfig {
        &self.profile
    }

    pub fn build(
        &self,
        operation: &Operation,
        sources: &[SourceMedia],
    ) -> Result<TransformPlan, EditError> {
        let first = sources
            .first()
            .ok_or_else(|| EditError::validation("no input media supplied"))?;
        let inputs = sources.iter().map(|source| source.path.clone()).collect();
        let mut plan = TransformPlan::new(operation.label(), inputs);

        match operation {
            Operation::Trim { start, end } => {
                plan.seek = Some(*start);
                plan.duration = Some(trim_duration(*start, *end));
                plan.video_filters = Some(self.capped(FilterChain::new()));
            }
            Operation::Filter(named) => {
                plan.video_filters = Some(self.capped(FilterChain::new().then(named.stage())));
            }
            Operation::Text(overlay) => {
                plan.video_filters =
                    Some(self.capped(FilterChain::new().then(self.drawtext(overlay))));
            }
            Operation::Merge => {
                if sources.len() < 2 {
                    return Err(EditError::validation(
                        "at least two filenames are required to merge",
                    ));
                }
                let infos = sources
                    .iter()
                    .map(|source| source.info.clone().ok_or_else(|| missing_probe(source)))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(index) = infos.iter().position(|info| !info.has_video) {
                    return Err(EditError::validation(format!(
                        "input {} has no video stream",
                        index + 1
                    )));
                }
                plan.complex_graph = Some(self.concat_graph(&infos));
                plan.maps = vec!["[outv]".to_string(), "[outa]".to_string()];
            }
            Operation::Audio(op) => {
                if !matches!(op, AudioOp::Mute) {
                    let info = first.info.as_ref().ok_or_else(|| missing_probe(first))?;
                    if !info.has_audio {
                        return Err(EditError::validation("input has no audio stream"));
                    }
                }
                match op {
                    AudioOp::Mute => {
                        plan.video_filters = Some(self.capped(FilterChain::new()));
                        plan.output = OutputKind::VideoWithoutAudio;
                    }
                    AudioOp::Volume(volume) => {
                        plan.video_filters = Some(self.capped(FilterChain::new()));
                        plan.audio_filters =
                            Some(FilterChain::new().then(Filter::new("volume").arg(num(*volume))));
                    }
                    AudioOp::FadeIn => {
                        plan.video_filters = Some(self.capped(FilterChain::new()));
                        plan.audio_filters = Some(FilterChain::new().then(
                            Filter::new("afade")
                                .opt("t", "in")
                                .opt("st", 0)
                                .opt("d", num(FADE_SECONDS)),
                        ));
                    }
                    AudioOp::FadeOut => {
                        let duration = first.info.as_ref().map(|i| i.duration).unwrap_or(0.0);
                        plan.video_filters = Some(self.capped(FilterChain::new()));
                        plan.audio_filters = Some(FilterChain::new().then(
                            Filter::new("afade")
                                .opt("t", "out")
                                .opt("st", num(fade_out_start(duration)))
                                .opt("d", num(FADE_SECONDS)),
                        ));
                    }
                    AudioOp::Extract => {
                        plan.output = OutputKind::AudioOnly;
                        plan.extension = "mp3";
                    }
                }
            }
        }

        plan.encoding = self.encoding_args(plan.output);
        Ok(plan)
    }

    /// Append the resolution cap and even-dimension rounding required by yuv420p.
    fn capped(&self, chain: FilterChain) -> FilterChain {
        let p = &self.profile;
        chain
            .then(
                Filter::new("scale")
                    .opt("w", format!("min({},iw)", p.max_width))
                    .opt("h", format!("min({},ih)", p.max_height))
                    .opt("force_original_aspect_ratio", "decrease"),
            )
            .then(
                Filter::new("scale")
                    .arg("trunc(iw/2)*2")
                    .arg("trunc(ih/2)*2"),
            )
    }

    fn drawtext(&self, overlay: &TextOverlay) -> Filter {
        let mut filter = Filter::new("drawtext");
        if let Some(font) = &self.profile.font_file {
            filter = filter.opt("fontfile", font.display());
        }
        filter = filter
            .opt("text", escape_drawtext_text(&overlay.text))
            .opt("fontsize", overlay.font_size)
            .opt("fontcolor", &overlay.font_color)
            .opt("x", &overlay.x)
            .opt("y", &overlay.y)
            .opt("box", 1)
            .opt("boxcolor", "black@0.5")
            .opt("boxborderw", 5);
        if let Some(enable) = overlay.enable_expr() {
            filter = filter.opt("enable", enable);
        }
        filter
    }

    /// Normalise every input to one resolution, frame rate and audio layout,
    /// then concatenate into a single video and audio pad.
    fn concat_graph(&self, infos: &[MediaInfo]) -> FilterGraph {
        let p = &self.profile;
        let (w, h) = (p.max_width, p.max_height);
        let mut graph = FilterGraph::new();
        let mut concat_inputs = Vec::with_capacity(infos.len() * 2);

        for (index, info) in infos.iter().enumerate() {
            let video_out = format!("v{index}");
            let audio_out = format!("a{index}");

            graph = graph.chain(
                [format!("{index}:v")],
                FilterChain::new()
                    .then(
                        Filter::new("scale")
                            .arg(w)
                            .arg(h)
                            .opt("force_original_aspect_ratio", "decrease"),
                    )
                    .then(
                        Filter::new("pad")
                            .arg(w)
                            .arg(h)
                            .arg("(ow-iw)/2")
                            .arg("(oh-ih)/2"),
                    )
                    .then(Filter::new("setsar").arg(1))
                    .then(Filter::new("fps").arg(p.frame_rate))
                    .then(Filter::new("format").arg("yuv420p")),
                [video_out.clone()],
            );

            let audio_format = Filter::new("aformat")
                .opt("sample_fmts", "fltp")
                .opt("sample_rates", p.sample_rate)
                .opt("channel_layouts", "stereo");
            graph = if info.has_audio {
                graph.chain(
                    [format!("{index}:a")],
                    FilterChain::new()
                        .then(Filter::new("aresample").arg(p.sample_rate))
                        .then(audio_format),
                    [audio_out.clone()],
                )
            } else {
                graph.chain(
                    Vec::<String>::new(),
                    FilterChain::new()
                        .then(
                            Filter::new("anullsrc")
                                .opt("channel_layout", "stereo")
                                .opt("sample_rate", p.sample_rate),
                        )
                        .then(Filter::new("atrim").opt("duration", num(info.duration.max(0.0))))
                        .then(audio_format),
                    [audio_out.clone()],
                )
            };

            concat_inputs.push(video_out);
            concat_inputs.push(audio_out);
        }

        graph.chain(
            concat_inputs,
            FilterChain::new().then(
                Filter::new("concat")
                    .opt("n", infos.len())
                    .opt("v", 1)
                    .opt("a", 1),
            ),
            ["outv", "outa"],
        )
    }

    fn encoding_args(&self, output: OutputKind) -> Vec<String> {
        let p = &self.profile;
        let mut args = Vec::new();
        match output {
            OutputKind::Video | OutputKind::VideoWithoutAudio => {
                args.extend(
                    [
                        "-c:v",
                        p.video_codec.as_str(),
                        "-preset",
                        p.preset.as_str(),
                    ]
                    .map(String::from),
                );
                args.extend(["-crf".to_string(), p.crf.to_string()]);
                args.extend(
                    [
                        "-b:v",
                        p.video_bitrate.as_str(),
                        "-maxrate",
                        p.max_bitrate.as_str(),
                        "-bufsize",
                        p.buffer_size.as_str(),
                        "-pix_fmt",
                        "yuv420p",
                    ]
                    .map(String::from),
                );
                if output == OutputKind::Video {
                    args.extend(self.audio_codec_args(&p.audio_codec));
                } else {
                    args.push("-an".to_string());
                }
                args.extend(["-movflags", "+faststart"].map(String::from));
            }
            OutputKind::AudioOnly => {
                args.push("-vn".to_string());
                args.extend(self.audio_codec_args("libmp3lame"));
            }
        }
        args.extend(["-threads".to_string(), p.threads.max(1).to_string()]);
        args
    }

    fn audio_codec_args(&self, codec: &str) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            self.profile.audio_bitrate.clone(),
            "-ar".to_string(),
            self.profile.sample_rate.to_string(),
        ]
    }
}

pub fn fade_out_start(duration: f64) -> f64 {
    (duration - FADE_SECONDS).max(0.0)
}

fn missing_probe(source: &SourceMedia) -> EditError {
    EditError::Engine(EngineError::Probe(format!(
        "no media information for {}",
        source.path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::graph::parse::{drawtext_literal, split_filter, split_options};
    use super::*;

    fn catalog() -> TransformCatalog {
        TransformCatalog::new(OutputConfig::default())
    }

    fn source(path: &str, info: Option<MediaInfo>) -> SourceMedia {
        SourceMedia {
            path: PathBuf::from(path),
            info,
        }
    }

    fn media(duration: f64, width: u32, height: u32, has_audio: bool) -> MediaInfo {
        MediaInfo {
            duration,
            width,
            height,
            has_video: true,
            has_audio,
        }
    }

    #[test]
    fn every_named_filter_parses_and_renders() {
        for filter in NamedFilter::ALL {
            let parsed: NamedFilter = filter.as_str().parse().expect("known filter");
            assert_eq!(parsed, filter);
            assert!(!filter.stage().to_string().is_empty());
        }
        assert_eq!("  Sepia ".parse::<NamedFilter>().ok(), Some(NamedFilter::Sepia));
    }

    #[test]
    fn unknown_filter_is_a_validation_error() {
        let err = "posterize".parse::<NamedFilter>().expect_err("unknown");
        assert!(matches!(err, EditError::Validation(msg) if msg.contains("posterize")));
    }

    #[test]
    fn trim_seeks_and_clamps_duration() {
        let plan = catalog()
            .build(
                &Operation::Trim {
                    start: 2.0,
                    end: 7.5,
                },
                &[source("/in/a.mp4", None)],
            )
            .expect("trim plan");
        assert_eq!(plan.seek, Some(2.0));
        assert_eq!(plan.duration, Some(5.5));
        assert_eq!(plan.extension, "mp4");
        let vf = plan.video_filters.expect("video chain").to_string();
        assert!(vf.starts_with("scale=w=min(1280\\,iw):h=min(720\\,ih)"), "{vf}");
    }

    #[test]
    fn trim_duration_never_negative() {
        assert_eq!(trim_duration(5.0, 3.0), 0.0);
        assert_eq!(trim_duration(1.0, 4.0), 3.0);
    }

    #[test]
    fn inverted_trim_is_accepted_with_zero_duration() {
        let operation = Operation::Trim {
            start: 5.0,
            end: 3.0,
        };
        TransformRequest::single("a.mp4", operation.clone())
            .validate()
            .expect("inverted trim validates");
        let plan = catalog()
            .build(&operation, &[source("/in/a.mp4", None)])
            .expect("trim plan");
        assert_eq!(plan.seek, Some(5.0));
        assert_eq!(plan.duration, Some(0.0));
    }

    #[test]
    fn trim_rejects_negative_or_non_finite_times() {
        for (start, end) in [(-1.0, 3.0), (1.0, -3.0), (f64::NAN, 3.0), (0.0, f64::INFINITY)] {
            let request = TransformRequest::single("a.mp4", Operation::Trim { start, end });
            assert!(
                matches!(request.validate(), Err(EditError::Validation(_))),
                "start={start} end={end}"
            );
        }
    }

    #[test]
    fn named_filter_precedes_scale_cap() {
        let plan = catalog()
            .build(
                &Operation::Filter(NamedFilter::Sepia),
                &[source("/in/a.mp4", None)],
            )
            .expect("filter plan");
        let chain = plan.video_filters.expect("video chain");
        let names: Vec<&str> = chain.filters().iter().map(Filter::name).collect();
        assert_eq!(names, ["colorchannelmixer", "scale", "scale"]);
    }

    #[test]
    fn text_overlay_escapes_user_text_into_one_option() {
        let mut overlay = TextOverlay::new(r"time: 10\20 [draft]");
        overlay.start = Some(1.0);
        overlay.end = Some(4.0);
        let plan = catalog()
            .build(&Operation::Text(overlay), &[source("/in/a.mp4", None)])
            .expect("text plan");
        let chain = plan.video_filters.expect("video chain");
        let drawtext = &chain.filters()[0];
        assert_eq!(drawtext.name(), "drawtext");
        assert_eq!(drawtext.option("enable"), Some("between(t,1,4)"));

        let (name, opts, remainder) = split_filter(&drawtext.to_string());
        assert_eq!(name, "drawtext");
        assert!(remainder.is_empty());
        let options = split_options(&opts);
        let text = options
            .iter()
            .find(|(key, _)| key == "text")
            .map(|(_, value)| drawtext_literal(value))
            .expect("text option");
        assert_eq!(text, r"time: 10\20 [draft]");
        assert!(options.iter().any(|(key, value)| key == "enable" && value == "between(t,1,4)"));
    }

    #[test]
    fn text_overlay_rejects_injection_in_positions_and_colors() {
        let mut overlay = TextOverlay::new("hi");
        overlay.x = "10:y=0,drawbox".to_string();
        let request = TransformRequest::single("a.mp4", Operation::Text(overlay));
        assert!(matches!(request.validate(), Err(EditError::Validation(_))));

        let mut overlay = TextOverlay::new("hi");
        overlay.font_color = "red;movie".to_string();
        let request = TransformRequest::single("a.mp4", Operation::Text(overlay));
        assert!(matches!(request.validate(), Err(EditError::Validation(_))));

        let request = TransformRequest::single("a.mp4", Operation::Text(TextOverlay::new("  ")));
        assert!(matches!(request.validate(), Err(EditError::Validation(_))));
    }

    #[test]
    fn merge_requires_two_inputs() {
        let request = TransformRequest {
            inputs: vec!["a.mp4".to_string()],
            operation: Operation::Merge,
        };
        assert!(matches!(request.validate(), Err(EditError::Validation(_))));
    }

    #[test]
    fn merge_normalises_each_input_then_concatenates() {
        let plan = catalog()
            .build(
                &Operation::Merge,
                &[
                    source("/in/a.mp4", Some(media(4.0, 1920, 1080, true))),
                    source("/in/b.mp4", Some(media(2.5, 640, 480, false))),
                ],
            )
            .expect("merge plan");
        assert_eq!(plan.inputs.len(), 2);
        assert_eq!(plan.maps, ["[outv]", "[outa]"]);
        assert!(plan.video_filters.is_none());

        let graph = plan.complex_graph.expect("complex graph");
        let rendered = graph.to_string();
        assert!(rendered.contains("[0:v]scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720"));
        assert!(rendered.contains("[1:v]scale=1280:720"));
        assert!(rendered.contains("[0:a]aresample=44100"));
        assert!(rendered.contains("anullsrc=channel_layout=stereo:sample_rate=44100,atrim=duration=2.5"));
        assert!(!rendered.contains("[1:a]"));
        assert!(rendered.ends_with("[v0][a0][v1][a1]concat=n=2:v=1:a=1[outv][outa]"));
        assert_eq!(graph.chains().len(), 5);
    }

    #[test]
    fn merge_without_probe_data_is_an_engine_error() {
        let err = catalog()
            .build(
                &Operation::Merge,
                &[source("/in/a.mp4", None), source("/in/b.mp4", None)],
            )
            .expect_err("needs probe");
        assert!(matches!(err, EditError::Engine(EngineError::Probe(_))));
    }

    #[test]
    fn merge_rejects_audio_only_input() {
        let audio_only = MediaInfo {
            has_video: false,
            width: 0,
            height: 0,
            ..media(30.0, 0, 0, true)
        };
        let err = catalog()
            .build(
                &Operation::Merge,
                &[
                    source("/in/a.mp4", Some(media(4.0, 640, 360, true))),
                    source("/in/b.mp3", Some(audio_only)),
                ],
            )
            .expect_err("audio-only merge input");
        assert!(matches!(err, EditError::Validation(msg) if msg == "input 2 has no video stream"));
    }

    #[test]
    fn fade_out_starts_three_seconds_before_end() {
        assert_eq!(fade_out_start(10.0), 7.0);
        assert_eq!(fade_out_start(1.5), 0.0);

        let plan = catalog()
            .build(
                &Operation::Audio(AudioOp::FadeOut),
                &[source("/in/a.mp4", Some(media(12.25, 640, 360, true)))],
            )
            .expect("fade plan");
        assert_eq!(
            plan.audio_filters.expect("audio chain").to_string(),
            "afade=t=out:st=9.25:d=3"
        );
    }

    #[test]
    fn audio_ops_reject_silent_inputs() {
        let err = catalog()
            .build(
                &Operation::Audio(AudioOp::FadeIn),
                &[source("/in/a.mp4", Some(media(5.0, 640, 360, false)))],
            )
            .expect_err("no audio");
        assert!(matches!(err, EditError::Validation(_)));
    }

    #[test]
    fn mute_drops_audio_and_extract_drops_video() {
        let muted = catalog()
            .build(&Operation::Audio(AudioOp::Mute), &[source("/in/a.mp4", None)])
            .expect("mute plan");
        assert_eq!(muted.output, OutputKind::VideoWithoutAudio);
        assert!(muted.encoding.contains(&"-an".to_string()));
        assert!(!muted.encoding.contains(&"-c:a".to_string()));

        let extracted = catalog()
            .build(
                &Operation::Audio(AudioOp::Extract),
                &[source("/in/a.mp4", Some(media(5.0, 640, 360, true)))],
            )
            .expect("extract plan");
        assert_eq!(extracted.output, OutputKind::AudioOnly);
        assert_eq!(extracted.extension, "mp3");
        assert!(extracted.encoding.contains(&"libmp3lame".to_string()));
        assert!(extracted.video_filters.is_none());
    }

    #[test]
    fn video_profile_is_capped_and_single_threaded() {
        let plan = catalog()
            .build(&Operation::Filter(NamedFilter::Mirror), &[source("/in/a.mp4", None)])
            .expect("plan");
        let args = plan.encoding.join(" ");
        assert!(args.contains("-c:v libx264 -preset ultrafast -crf 28"));
        assert!(args.contains("-maxrate 1.5M -bufsize 2M"));
        assert!(args.contains("-c:a aac -b:a 128k"));
        assert!(args.ends_with("-threads 1"));
    }

    #[test]
    fn volume_must_be_in_range() {
        for volume in [-1.0, f64::NAN, 11.0] {
            let request =
                TransformRequest::single("a.mp4", Operation::Audio(AudioOp::Volume(volume)));
            assert!(request.validate().is_err(), "volume {volume} accepted");
        }
        let request = TransformRequest::single("a.mp4", Operation::Audio(AudioOp::Volume(1.5)));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn audio_op_parsing() {
        assert_eq!(AudioOp::parse("fadeOut", None).ok(), Some(AudioOp::FadeOut));
        assert_eq!(
            AudioOp::parse("volume", Some(0.5)).ok(),
            Some(AudioOp::Volume(0.5))
        );
        assert!(AudioOp::parse("volume", None).is_err());
        assert!(AudioOp::parse("reverse", None).is_err());
    }
}
