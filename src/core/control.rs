//! Session parameters of the cache: position, travel direction, weighting and budget.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Travel direction through the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Towards higher keys
    #[default]
    Forward,
    /// Towards lower keys
    Backward,
}

impl Direction {
    /// +1 for Forward, -1 for Backward
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// Ahead:behind weighting presets for priority interleaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Weighting {
    /// 1:1 - equal look-ahead and look-behind
    #[default]
    Even,
    /// 2:1
    Ahead2,
    /// 3:1
    Ahead3,
    /// 4:1
    Ahead4,
    /// 9:1
    Ahead9,
    /// 100:1 - practically ahead only
    AheadOnly,
}

impl Weighting {
    pub const ALL: [Weighting; 6] = [
        Weighting::Even,
        Weighting::Ahead2,
        Weighting::Ahead3,
        Weighting::Ahead4,
        Weighting::Ahead9,
        Weighting::AheadOnly,
    ];

    /// (ahead amount, behind amount)
    pub fn ratio(self) -> (usize, usize) {
        match self {
            Weighting::Even => (1, 1),
            Weighting::Ahead2 => (2, 1),
            Weighting::Ahead3 => (3, 1),
            Weighting::Ahead4 => (4, 1),
            Weighting::Ahead9 => (9, 1),
            Weighting::AheadOnly => (100, 1),
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ahead, behind) = self.ratio();
        write!(f, "{}:{}", ahead, behind)
    }
}

impl FromStr for Weighting {
    type Err = String;

    /// Accepts "A:B" ratios of the presets ("1:1", "9:1", ...)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Weighting::ALL
            .into_iter()
            .find(|w| w.to_string() == s)
            .ok_or_else(|| {
                let known: Vec<String> = Weighting::ALL.iter().map(|w| w.to_string()).collect();
                format!("unknown weighting '{}', expected one of {}", s, known.join(", "))
            })
    }
}

/// Dispatcher state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchPhase {
    #[default]
    Idle,
    Planning,
    Dispatching,
    Draining,
}

/// Mutable session state shared by the planners and the dispatcher.
#[derive(Debug, Clone)]
pub struct CacheControl {
    pub current_key: usize,
    pub previous_key: usize,
    pub direction: Direction,
    /// Signed net steps taken against `direction` since last confirmation
    pub hysteresis: i64,
    pub ahead_weight: usize,
    pub behind_weight: usize,
    pub weighting: Weighting,
    /// Effective budget after the memory governor
    pub max_mb: f64,
    /// Budget as configured by the user
    pub configured_max_mb: f64,
    pub min_mb: f64,
    pub current_mb: f64,
    pub target_first: Option<usize>,
    pub target_last: Option<usize>,
}

impl CacheControl {
    pub fn new(max_mb: f64, min_mb: f64, weighting: Weighting) -> Self {
        let (ahead_weight, behind_weight) = weighting.ratio();
        Self {
            current_key: 0,
            previous_key: 0,
            direction: Direction::Forward,
            hysteresis: 0,
            ahead_weight,
            behind_weight,
            weighting,
            max_mb,
            configured_max_mb: max_mb,
            min_mb,
            current_mb: 0.0,
            target_first: None,
            target_last: None,
        }
    }

    /// Reset navigation state for a rebuilt view; budget and weighting survive.
    pub fn reset(&mut self) {
        self.current_key = 0;
        self.previous_key = 0;
        self.direction = Direction::Forward;
        self.hysteresis = 0;
        self.target_first = None;
        self.target_last = None;
    }

    pub fn set_weighting(&mut self, weighting: Weighting) {
        let (ahead, behind) = weighting.ratio();
        self.weighting = weighting;
        self.ahead_weight = ahead;
        self.behind_weight = behind;
    }

    /// True if `key` lies inside the current target window
    pub fn in_target(&self, key: usize) -> bool {
        match (self.target_first, self.target_last) {
            (Some(first), Some(last)) => key >= first && key <= last,
            _ => false,
        }
    }
}
