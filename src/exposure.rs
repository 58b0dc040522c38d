//! Intensity → effect lookup tables.
//!
//! Operators describe how each grey level is written with short range rules,
//! one per line:
//!
//! ```text
//! [0,128):1.5        intensities 0..=127 expose for 1.5 s
//! [128,256):0.01x    linear ramp: intensity i exposes for 0.01 * i s
//! ```
//!
//! Ranges are half-open over the 0-255 domain (`end` may be 256). `]` is
//! accepted as the closing bracket. Rules apply in order, later rules
//! overwriting earlier ones; ignore rules then zero their spans no matter
//! where they appeared. Power rules use the same grammar and build the laser
//! power table, clamped to the head's maximum.

use crate::error::{HoloError, HoloResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Index;
use tracing::{debug, warn};

/// Number of grey levels.
pub const INTENSITY_LEVELS: usize = 256;

static RULE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^\[\s*(\d+)\s*,\s*(\d+)\s*[)\]]\s*(?::?\s*(\S.*?))?\s*$")
        .expect("range rule pattern is valid")
});

/// Fixed table of one effect per grey level.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectTable {
    values: [f64; INTENSITY_LEVELS],
}

impl Default for EffectTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl EffectTable {
    /// Table with every entry 0.
    pub fn zeroed() -> Self {
        Self {
            values: [0.0; INTENSITY_LEVELS],
        }
    }

    /// Effect for `intensity`.
    pub fn get(&self, intensity: u8) -> f64 {
        self.values[usize::from(intensity)]
    }

    /// All 256 entries.
    pub fn values(&self) -> &[f64; INTENSITY_LEVELS] {
        &self.values
    }

    /// True when no intensity has an effect.
    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Largest entry.
    pub fn max_value(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }

    fn apply(&mut self, rule: &RangeRule) {
        for i in rule.start..rule.end {
            self.values[i] = rule.effect.map_or(0.0, |effect| effect.at(i));
        }
    }

    fn clear(&mut self, rule: &RangeRule) {
        for value in &mut self.values[rule.start..rule.end] {
            *value = 0.0;
        }
    }
}

impl Index<u8> for EffectTable {
    type Output = f64;

    fn index(&self, intensity: u8) -> &f64 {
        &self.values[usize::from(intensity)]
    }
}

/// What a rule assigns inside its span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    /// Same value for every intensity.
    Constant(f64),
    /// `slope * intensity`.
    Ramp {
        /// Effect per intensity step.
        slope: f64,
    },
}

impl Effect {
    /// Effect at intensity `i`.
    pub fn at(self, i: usize) -> f64 {
        match self {
            Effect::Constant(value) => value,
            #[allow(clippy::cast_precision_loss)]
            Effect::Ramp { slope } => slope * i as f64,
        }
    }
}

/// One parsed `[start,end):effect` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRule {
    /// First intensity covered.
    pub start: usize,
    /// One past the last intensity covered.
    pub end: usize,
    /// Assigned effect; ignore rules carry none.
    pub effect: Option<Effect>,
}

impl RangeRule {
    /// Parse a rule that must carry an effect (exposure and power rules).
    pub fn parse(line: &str) -> HoloResult<Self> {
        let rule = Self::parse_any(line)?;
        if rule.effect.is_none() {
            return Err(HoloError::malformed(line, "missing effect after the range"));
        }
        Ok(rule)
    }

    /// Parse an ignore rule; any effect after the range is discarded.
    pub fn parse_ignore(line: &str) -> HoloResult<Self> {
        let rule = Self::parse_any(line)?;
        Ok(Self { effect: None, ..rule })
    }

    fn parse_any(line: &str) -> HoloResult<Self> {
        let text = line.trim();
        let captures = RULE_PATTERN
            .captures(text)
            .ok_or_else(|| HoloError::malformed(line, "expected [start,end):value or [start,end):slope x"))?;

        let bound = |index: usize, name: &str| -> HoloResult<usize> {
            captures[index]
                .parse::<usize>()
                .map_err(|_| HoloError::malformed(line, format!("{name} is not a valid intensity")))
        };
        let start = bound(1, "start")?;
        let end = bound(2, "end")?;
        if end > INTENSITY_LEVELS {
            return Err(HoloError::malformed(
                line,
                format!("end {end} is outside 0..={INTENSITY_LEVELS}"),
            ));
        }
        if start > end {
            return Err(HoloError::malformed(line, format!("start {start} is after end {end}")));
        }

        let effect = captures
            .get(3)
            .map(|m| parse_effect(line, m.as_str()))
            .transpose()?;
        Ok(Self { start, end, effect })
    }
}

fn parse_effect(line: &str, text: &str) -> HoloResult<Effect> {
    let text = text.trim();
    let (number, ramp) = match text.strip_suffix(['x', 'X']) {
        Some(slope) => (slope.trim_end(), true),
        None => (text, false),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| HoloError::malformed(line, format!("'{text}' is not a number")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(HoloError::malformed(
            line,
            format!("effect must be a non-negative finite number, got {value}"),
        ));
    }
    Ok(if ramp {
        Effect::Ramp { slope: value }
    } else {
        Effect::Constant(value)
    })
}

/// Exposure duration (seconds) and laser power (mW) per grey level.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureMap {
    /// Seconds the shutter stays open per intensity.
    pub exposure: EffectTable,
    /// Laser power per intensity.
    pub power: EffectTable,
}

impl ExposureMap {
    /// Start a builder whose power table is clamped to `max_power_mw`.
    pub fn builder(max_power_mw: f64) -> ExposureMapBuilder {
        ExposureMapBuilder::new(max_power_mw)
    }

    /// Seconds of exposure for `intensity`.
    pub fn exposure_for(&self, intensity: u8) -> f64 {
        self.exposure.get(intensity)
    }

    /// Laser power for `intensity`.
    pub fn power_for(&self, intensity: u8) -> f64 {
        self.power.get(intensity)
    }

    /// Whether pixels of `intensity` are written at all.
    pub fn is_exposed(&self, intensity: u8) -> bool {
        self.exposure.get(intensity) != 0.0
    }
}

/// Collects rule lines and builds an [`ExposureMap`].
#[derive(Debug, Clone)]
pub struct ExposureMapBuilder {
    max_power_mw: f64,
    exposure: Vec<String>,
    ignore: Vec<String>,
    power: Vec<String>,
}

impl ExposureMapBuilder {
    /// Empty builder.
    pub fn new(max_power_mw: f64) -> Self {
        Self {
            max_power_mw,
            exposure: Vec::new(),
            ignore: Vec::new(),
            power: Vec::new(),
        }
    }

    /// Append exposure rules.
    pub fn exposure<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposure.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Append ignore rules.
    pub fn ignore<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Append power rules.
    pub fn power<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.power.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Parse every rule and build both tables.
    ///
    /// All lines are parsed before any table is touched, so a malformed rule
    /// anywhere fails the whole build.
    pub fn build(self) -> HoloResult<ExposureMap> {
        if !self.max_power_mw.is_finite() || self.max_power_mw <= 0.0 {
            return Err(HoloError::Configuration(format!(
                "maximum laser power must be positive, got {}",
                self.max_power_mw
            )));
        }

        let exposure_rules = parse_lines(&self.exposure, RangeRule::parse)?;
        let ignore_rules = parse_lines(&self.ignore, RangeRule::parse_ignore)?;
        let power_rules = parse_lines(&self.power, RangeRule::parse)?;

        let mut exposure = EffectTable::zeroed();
        for rule in &exposure_rules {
            exposure.apply(rule);
        }
        for rule in &ignore_rules {
            exposure.clear(rule);
        }

        let mut power = EffectTable::zeroed();
        for rule in &power_rules {
            power.apply(rule);
        }
        let mut clamped = 0usize;
        for value in &mut power.values {
            if *value > self.max_power_mw {
                *value = self.max_power_mw;
                clamped += 1;
            }
        }
        if clamped > 0 {
            warn!(
                clamped,
                max_power_mw = self.max_power_mw,
                "power table entries above maximum clamped"
            );
        }

        debug!(
            exposure_rules = exposure_rules.len(),
            ignore_rules = ignore_rules.len(),
            power_rules = power_rules.len(),
            "exposure map built"
        );
        Ok(ExposureMap { exposure, power })
    }
}

fn parse_lines(
    lines: &[String],
    parse: fn(&str) -> HoloResult<RangeRule>,
) -> HoloResult<Vec<RangeRule>> {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse(line))
        .collect()
}
