//! Byte pattern generation
//!
//! Buffers larger than one tiling unit (1 MiB) are built by repeating a
//! single generated unit, which keeps generation of multi-GiB buffers fast.
//! A tiled random buffer is therefore periodic with a 1 MiB period; pass
//! [`GenerateOptions::exact`] when every byte must be independent.

use crate::cancel::CancellationToken;
use crate::util::units::{format_bytes, parse_bytes};
use crate::{DiskPakError, Result, MB};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Size of the unit repeated when tiling large buffers
pub const TILE_UNIT: usize = MB as usize;

/// How buffer bytes are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Each byte uniform in 0..=255
    Random,
    /// Every byte equal to the given value
    Constant(u8),
}

impl Default for FillPolicy {
    fn default() -> Self {
        FillPolicy::Random
    }
}

impl fmt::Display for FillPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillPolicy::Random => write!(f, "random"),
            FillPolicy::Constant(value) => write!(f, "{}", value),
        }
    }
}

impl FromStr for FillPolicy {
    type Err = String;

    /// `random` or a byte value `0..=255`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("random") {
            return Ok(FillPolicy::Random);
        }
        s.parse::<u8>()
            .map(FillPolicy::Constant)
            .map_err(|_| format!("Fill must be 'random' or a byte value 0-255, got '{}'", s))
    }
}

// Written as "random" or a bare byte value
impl Serialize for FillPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FillPolicy::Random => serializer.serialize_str("random"),
            FillPolicy::Constant(value) => serializer.serialize_u8(*value),
        }
    }
}

impl<'de> Deserialize<'de> for FillPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u8::try_from(n)
                .map(FillPolicy::Constant)
                .map_err(|_| serde::de::Error::custom(format!("fill value {} is not a byte", n))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Requested buffer size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Exact(u64),
    /// Determined by the throughput probe
    Auto,
}

impl Default for SizeSpec {
    fn default() -> Self {
        SizeSpec::Exact(MB)
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Exact(bytes) => write!(f, "{}", format_bytes(*bytes)),
            SizeSpec::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for SizeSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(SizeSpec::Auto)
        } else {
            parse_bytes(s).map(SizeSpec::Exact)
        }
    }
}

impl Serialize for SizeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SizeSpec::Exact(bytes) => serializer.serialize_u64(*bytes),
            SizeSpec::Auto => serializer.serialize_str("auto"),
        }
    }
}

impl<'de> Deserialize<'de> for SizeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(SizeSpec::Exact(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Where a buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSource {
    Generated,
    /// Chosen by the throughput probe
    Probed,
    /// Read back from an existing data file; its fill policy is unknown
    Loaded,
}

/// What a step wants its buffer to look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub size: SizeSpec,
    pub fill: FillPolicy,
}

impl BufferSpec {
    pub fn new(size: SizeSpec, fill: FillPolicy) -> Self {
        Self { size, fill }
    }
}

/// Immutable, shareable byte pattern
#[derive(Debug, Clone)]
pub struct PatternBuffer {
    data: Arc<[u8]>,
    fill: FillPolicy,
    source: BufferSource,
}

impl PatternBuffer {
    pub fn new(data: Vec<u8>, fill: FillPolicy, source: BufferSource) -> Result<Self> {
        if data.is_empty() {
            return Err(DiskPakError::InvalidConfiguration(
                "Pattern buffer cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            data: data.into(),
            fill,
            source,
        })
    }

    /// Wrap bytes loaded from an existing data file
    pub fn loaded(data: Vec<u8>) -> Result<Self> {
        Self::new(data, FillPolicy::Random, BufferSource::Loaded)
    }

    pub(crate) fn with_source(mut self, source: BufferSource) -> Self {
        self.source = source;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn fill(&self) -> FillPolicy {
        self.fill
    }

    pub fn source(&self) -> BufferSource {
        self.source
    }

    /// Whether this buffer can stand in for a freshly generated one.
    ///
    /// Loaded buffers never match: their fill policy was not recorded.
    pub fn matches(&self, spec: &BufferSpec) -> bool {
        if self.source == BufferSource::Loaded || self.fill != spec.fill {
            return false;
        }
        match spec.size {
            SizeSpec::Exact(size) => self.data.len() as u64 == size,
            SizeSpec::Auto => self.source == BufferSource::Probed,
        }
    }
}

impl AsRef<[u8]> for PatternBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Knobs for [`generate_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Generate every byte independently instead of tiling a 1 MiB unit
    pub exact: bool,
}

impl GenerateOptions {
    pub fn exact() -> Self {
        Self { exact: true }
    }
}

/// Generate a buffer of `size` bytes, tiling a 1 MiB unit above 1 MiB
pub fn generate(size: u64, fill: FillPolicy, cancel: &CancellationToken) -> Result<PatternBuffer> {
    generate_with(size, fill, GenerateOptions::default(), cancel)
}

pub fn generate_with(
    size: u64,
    fill: FillPolicy,
    options: GenerateOptions,
    cancel: &CancellationToken,
) -> Result<PatternBuffer> {
    if size == 0 {
        return Err(DiskPakError::InvalidConfiguration(
            "Buffer size must be greater than 0".to_string(),
        ));
    }
    let size = usize::try_from(size).map_err(|_| {
        DiskPakError::InvalidConfiguration(format!(
            "Buffer size {} does not fit in memory",
            format_bytes(size)
        ))
    })?;
    debug!(size = %format_bytes(size as u64), %fill, exact = options.exact, "generating pattern");

    if size <= TILE_UNIT {
        return PatternBuffer::new(fill_unit(size, fill), fill, BufferSource::Generated);
    }

    let mut rng = SmallRng::from_entropy();
    let unit = fill_unit(TILE_UNIT, fill);
    let units = size / TILE_UNIT;
    let report_every = progress_cadence(units);
    let mut data = Vec::with_capacity(size);

    for i in 0..units {
        if cancel.is_cancelled() {
            return Err(DiskPakError::Cancelled(format!(
                "Pattern generation stopped after {} of {}",
                format_bytes(data.len() as u64),
                format_bytes(size as u64)
            )));
        }
        if i % report_every == 0 {
            info!("generating pattern: {:.3}%", (i + 1) as f64 / units as f64 * 100.0);
        }
        match (options.exact, fill) {
            (true, FillPolicy::Random) => {
                let start = data.len();
                data.resize(start + TILE_UNIT, 0);
                rng.fill_bytes(&mut data[start..]);
            }
            _ => data.extend_from_slice(&unit),
        }
    }

    let remainder = size % TILE_UNIT;
    if remainder > 0 {
        match (options.exact, fill) {
            (true, FillPolicy::Random) => {
                let start = data.len();
                data.resize(start + remainder, 0);
                rng.fill_bytes(&mut data[start..]);
            }
            _ => data.extend_from_slice(&unit[..remainder]),
        }
    }

    PatternBuffer::new(data, fill, BufferSource::Generated)
}

fn fill_unit(size: usize, fill: FillPolicy) -> Vec<u8> {
    match fill {
        FillPolicy::Constant(value) => vec![value; size],
        FillPolicy::Random => {
            let mut data = vec![0u8; size];
            SmallRng::from_entropy().fill_bytes(&mut data);
            data
        }
    }
}

/// Log roughly every 5 * 10^(digits - 2) units
fn progress_cadence(units: usize) -> usize {
    let digits = (units.max(1) as f64).log10().floor() as i32;
    10usize.pow((digits - 1).max(0) as u32) * 5
}
