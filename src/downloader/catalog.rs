//! Static player-client and format-strategy catalog.
//!
//! Both lists are ordered: player clients from most to least reliable,
//! format strategies from most specific to most permissive. The fallback
//! engine walks them by index, so the order here is the search order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Player clients presented to the platform, most reliable first.
pub const PLAYER_CLIENTS: [&str; 6] = ["tv", "web_safari", "mweb", "android_vr", "ios", "web"];

/// Format strategies, most specific first.
pub const FORMAT_STRATEGIES: [FormatStrategy; 5] = [
    FormatStrategy::Preferred,
    FormatStrategy::AnyContainer,
    FormatStrategy::AnyQuality,
    FormatStrategy::BestAvailable,
    FormatStrategy::HlsEscapeHatch,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormatStrategy {
    /// Quality ceiling with mp4/m4a containers.
    Preferred,
    /// Quality ceiling, any container.
    AnyContainer,
    /// No ceiling, any container.
    AnyQuality,
    /// Whatever the extractor can find.
    BestAvailable,
    /// m3u8 formats first. The SABR delivery mode breaks the https DASH
    /// formats of some clients while leaving HLS untouched.
    HlsEscapeHatch,
}

impl FormatStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FormatStrategy::Preferred => "preferred",
            FormatStrategy::AnyContainer => "any_container",
            FormatStrategy::AnyQuality => "any_quality",
            FormatStrategy::BestAvailable => "best_available",
            FormatStrategy::HlsEscapeHatch => "hls_escape_hatch",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreference {
    Best,
    Uhd2160,
    Qhd1440,
    #[default]
    Fhd1080,
    Hd720,
    Sd480,
    Sd360,
    AudioOnly,
}

impl QualityPreference {
    /// Maximum video height, `None` when uncapped or audio only.
    pub fn height_ceiling(&self) -> Option<u32> {
        match self {
            QualityPreference::Best | QualityPreference::AudioOnly => None,
            QualityPreference::Uhd2160 => Some(2160),
            QualityPreference::Qhd1440 => Some(1440),
            QualityPreference::Fhd1080 => Some(1080),
            QualityPreference::Hd720 => Some(720),
            QualityPreference::Sd480 => Some(480),
            QualityPreference::Sd360 => Some(360),
        }
    }
}

impl fmt::Display for QualityPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityPreference::Best => write!(f, "best"),
            QualityPreference::AudioOnly => write!(f, "audio"),
            other => write!(f, "{}p", other.height_ceiling().unwrap_or_default()),
        }
    }
}

impl FromStr for QualityPreference {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let quality = match normalized.trim_end_matches('p') {
            "best" | "max" | "highest" => QualityPreference::Best,
            "2160" | "4k" => QualityPreference::Uhd2160,
            "1440" | "2k" => QualityPreference::Qhd1440,
            "1080" => QualityPreference::Fhd1080,
            "720" => QualityPreference::Hd720,
            "480" => QualityPreference::Sd480,
            "360" => QualityPreference::Sd360,
            "audio" | "audio_only" | "audioonly" => QualityPreference::AudioOnly,
            _ => {
                return Err(AppError::InvalidInput(format!(
                    "Unknown quality preference: {}",
                    s
                )))
            }
        };
        Ok(quality)
    }
}

pub fn player_client_count() -> usize {
    PLAYER_CLIENTS.len()
}

pub fn format_strategy_count() -> usize {
    FORMAT_STRATEGIES.len()
}

/// Total number of (client, strategy) combinations.
pub fn default_max_attempts() -> u32 {
    (player_client_count() * format_strategy_count()) as u32
}

/// Looks up a player client, clamping out-of-range indices.
pub fn player_client(index: usize) -> &'static str {
    PLAYER_CLIENTS[index.min(PLAYER_CLIENTS.len() - 1)]
}

/// Looks up a format strategy, clamping out-of-range indices.
pub fn format_strategy(index: usize) -> FormatStrategy {
    FORMAT_STRATEGIES[index.min(FORMAT_STRATEGIES.len() - 1)]
}

/// `--extractor-args` value selecting a player client.
pub fn extractor_args(client: &str) -> String {
    format!("youtube:player_client={}", client)
}

/// Builds the `-f` selector chain for a strategy. The tool tries each
/// `/`-separated alternative from left to right.
pub fn format_expression(strategy: FormatStrategy, quality: QualityPreference) -> String {
    if quality == QualityPreference::AudioOnly {
        return audio_expression(strategy);
    }

    let cap = quality
        .height_ceiling()
        .map(|h| format!("[height<={}]", h))
        .unwrap_or_default();

    match strategy {
        FormatStrategy::Preferred => format!(
            "bestvideo{cap}[ext=mp4]+bestaudio[ext=m4a]/best{cap}[ext=mp4]",
            cap = cap
        ),
        FormatStrategy::AnyContainer => {
            format!("bestvideo{cap}+bestaudio/best{cap}", cap = cap)
        }
        FormatStrategy::AnyQuality => "bestvideo+bestaudio/best".to_string(),
        FormatStrategy::BestAvailable => "b/bv*+ba/bv*/ba*".to_string(),
        FormatStrategy::HlsEscapeHatch => format!(
            "best{cap}[protocol^=m3u8]/bestvideo{cap}[protocol^=m3u8]+bestaudio/best",
            cap = cap
        ),
    }
}

fn audio_expression(strategy: FormatStrategy) -> String {
    match strategy {
        FormatStrategy::Preferred => "bestaudio[ext=m4a]/bestaudio[ext=mp3]",
        FormatStrategy::AnyContainer => "bestaudio",
        FormatStrategy::AnyQuality => "bestaudio/best",
        FormatStrategy::BestAvailable => "ba*/b",
        FormatStrategy::HlsEscapeHatch => "bestaudio[protocol^=m3u8]/best[protocol^=m3u8]/bestaudio",
    }
    .to_string()
}
