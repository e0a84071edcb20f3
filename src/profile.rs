//! Traffic profiles
//!
//! A profile names the statistical template every engine draws from.

use anyhow::anyhow;
use clap::ValueEnum;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Application traffic a stream imitates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrafficProfile {
    Web,
    Video,
    Voip,
    File,
    Gaming,
    /// Meta-profile that samples the others
    #[default]
    Mixed,
}

impl TrafficProfile {
    /// Every profile except `Mixed`
    pub const CONCRETE: [TrafficProfile; 5] = [
        TrafficProfile::Web,
        TrafficProfile::Video,
        TrafficProfile::Voip,
        TrafficProfile::File,
        TrafficProfile::Gaming,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficProfile::Web => "web",
            TrafficProfile::Video => "video",
            TrafficProfile::Voip => "voip",
            TrafficProfile::File => "file",
            TrafficProfile::Gaming => "gaming",
            TrafficProfile::Mixed => "mixed",
        }
    }

    /// Resolve `Mixed` to a random concrete profile; concrete profiles map to themselves.
    pub fn concrete<R: Rng + ?Sized>(self, rng: &mut R) -> TrafficProfile {
        match self {
            TrafficProfile::Mixed => *Self::CONCRETE
                .choose(rng)
                .unwrap_or(&TrafficProfile::Web),
            other => other,
        }
    }
}

impl fmt::Display for TrafficProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(TrafficProfile::Web),
            "video" => Ok(TrafficProfile::Video),
            "voip" => Ok(TrafficProfile::Voip),
            "file" => Ok(TrafficProfile::File),
            "gaming" => Ok(TrafficProfile::Gaming),
            "mixed" => Ok(TrafficProfile::Mixed),
            other => Err(anyhow!("Unknown traffic profile: {}", other)),
        }
    }
}
