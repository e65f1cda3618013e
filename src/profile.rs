use crate::common::{Dtype, Variant};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;

/// The compile-time profile of a reduce operator as produced by the upstream compilation step.
///
/// This is the unvalidated, serialized form. Convert it into a [CompileProfile] (which checks
/// every table) before serving tiling requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompileInfo {
    pub lane_count: i64,
    /// Elements per aligned DMA transfer for `dtype`.
    pub dma_align: i64,
    pub dtype: Dtype,
    #[serde(default)]
    pub keep_dims: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub transpose: bool,
    #[serde(default)]
    pub group_reduce: bool,
    /// The dynamic pattern compiled into each budget slot.
    pub patterns: Vec<i32>,
    pub budgets: BudgetInfo,
    #[serde(default)]
    pub shape_known: bool,
    /// Static pattern key to `(lanes_used, atomic)`.
    #[serde(default)]
    pub precomputed: BTreeMap<String, (i64, bool)>,
    /// Dispatch key to the ordered names of the parameters its kernel reads.
    #[serde(default)]
    pub vars: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub zero_onchip_factor: Option<i64>,
}

/// Per-slot on-chip budgets, in elements. Zero in an optional table marks the variant as
/// unsupported for that slot.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BudgetInfo {
    pub normal: Vec<i64>,
    #[serde(default)]
    pub rfactor: Option<Vec<i64>>,
    #[serde(default)]
    pub padded: Option<Vec<i64>>,
    #[serde(default)]
    pub transposed: Option<Vec<i64>>,
}

/// Validated, immutable compile-time profile shared by every tiling request of one operator.
#[derive(Debug, Clone)]
pub struct CompileProfile {
    lane_count: NonZeroU32,
    dma_align: NonZeroU32,
    dtype: Dtype,
    keep_dims: bool,
    capabilities: Capabilities,
    slots: Vec<(i32, BudgetRow)>,
    shape_known: bool,
    precomputed: HashMap<i32, PrecomputedPlan>,
    vars: HashMap<i32, Vec<TilingVar>>,
    zero_onchip_factor: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub atomic: bool,
    pub transpose: bool,
    pub group_reduce: bool,
}

/// The budgets of one pattern slot, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetRow {
    pub normal: u64,
    pub rfactor: Option<u64>,
    pub padded: Option<u64>,
    pub transposed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecomputedPlan {
    pub lanes_used: u32,
    pub atomic: bool,
}

/// A value a kernel reads from the serialized parameter stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TilingVar {
    /// Extent of a canonical axis.
    Dim(usize),
    BlockFactor,
    OnchipFactor,
    /// A caller-supplied operator attribute.
    Attr(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    #[error("Malformed profile document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be positive; got {value}")]
    NotPositive { field: &'static str, value: i64 },
    #[error("Budget table {table} has {len} entries but {patterns} patterns are declared")]
    LengthMismatch {
        table: &'static str,
        len: usize,
        patterns: usize,
    },
    #[error("Budget table {table} has a negative entry {value} in slot {slot}")]
    NegativeBudget {
        table: &'static str,
        slot: usize,
        value: i64,
    },
    #[error("Budget table {table} entry {budget} in slot {slot} is below one alignment quantum ({dma_align})")]
    BudgetBelowAlignment {
        table: &'static str,
        slot: usize,
        budget: u64,
        dma_align: u32,
    },
    #[error("Precomputed plan {key} uses {lanes_used} lanes but only {lane_count} exist")]
    PrecomputedLanesExceed {
        key: i32,
        lanes_used: u32,
        lane_count: u32,
    },
    #[error("Pattern {0} is declared more than once")]
    DuplicatePattern(i32),
    #[error("Key {0:?} is not an integer")]
    MalformedKey(String),
    #[error("Unknown tiling variable {0:?}")]
    UnknownVar(String),
}

impl CompileProfile {
    pub fn from_json(document: &str) -> Result<Self, ProfileError> {
        let info: CompileInfo = serde_json::from_str(document)?;
        CompileProfile::try_from(info)
    }

    pub fn lane_count(&self) -> u32 {
        self.lane_count.get()
    }

    pub fn dma_align(&self) -> u32 {
        self.dma_align.get()
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn keep_dims(&self) -> bool {
        self.keep_dims
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether every extent is known at compile time, so plans come from [Self::precomputed].
    pub fn shape_known(&self) -> bool {
        self.shape_known
    }

    /// Returns the budgets compiled for a dynamic pattern, if that pattern was compiled.
    pub fn budgets(&self, pattern: i32) -> Option<&BudgetRow> {
        self.slots
            .iter()
            .find(|(p, _)| *p == pattern)
            .map(|(_, row)| row)
    }

    pub fn precomputed(&self, static_pattern: i32) -> Option<PrecomputedPlan> {
        self.precomputed.get(&static_pattern).copied()
    }

    pub fn vars(&self, dispatch_key: i32) -> Option<&[TilingVar]> {
        self.vars.get(&dispatch_key).map(|v| v.as_slice())
    }

    pub fn zero_onchip_factor(&self) -> Option<u32> {
        self.zero_onchip_factor
    }
}

impl TryFrom<CompileInfo> for CompileProfile {
    type Error = ProfileError;

    fn try_from(info: CompileInfo) -> Result<Self, Self::Error> {
        let lane_count = positive_u32("lane_count", info.lane_count)?;
        let dma_align = positive_u32("dma_align", info.dma_align)?;

        let pattern_count = info.patterns.len();
        if let Some(&p) = info.patterns.iter().duplicates().next() {
            return Err(ProfileError::DuplicatePattern(p));
        }

        check_len("normal", &info.budgets.normal, pattern_count)?;
        let optional = |table, values: &Option<Vec<i64>>| {
            optional_table(table, values.as_deref(), pattern_count, dma_align.get())
        };
        let rfactor = optional("rfactor", &info.budgets.rfactor)?;
        let padded = optional("padded", &info.budgets.padded)?;
        let transposed = optional("transposed", &info.budgets.transposed)?;

        let mut slots = Vec::with_capacity(pattern_count);
        for (slot, (&pattern, &normal)) in
            info.patterns.iter().zip(&info.budgets.normal).enumerate()
        {
            if normal <= 0 {
                return Err(ProfileError::NotPositive {
                    field: "normal budget",
                    value: normal,
                });
            }
            let normal = normal as u64;
            if normal < u64::from(dma_align.get()) {
                return Err(ProfileError::BudgetBelowAlignment {
                    table: "normal",
                    slot,
                    budget: normal,
                    dma_align: dma_align.get(),
                });
            }
            let row = BudgetRow {
                normal,
                rfactor: rfactor.as_ref().and_then(|t| t[slot]),
                padded: padded.as_ref().and_then(|t| t[slot]),
                transposed: transposed.as_ref().and_then(|t| t[slot]),
            };
            slots.push((pattern, row));
        }

        let precomputed = info
            .precomputed
            .into_iter()
            .map(|(key, (lanes_used, atomic))| {
                let key = parse_key(&key)?;
                let lanes_used = positive_u32("precomputed lanes_used", lanes_used)?;
                if lanes_used > lane_count {
                    return Err(ProfileError::PrecomputedLanesExceed {
                        key,
                        lanes_used: lanes_used.get(),
                        lane_count: lane_count.get(),
                    });
                }
                Ok((
                    key,
                    PrecomputedPlan {
                        lanes_used: lanes_used.get(),
                        atomic,
                    },
                ))
            })
            .collect::<Result<HashMap<_, _>, ProfileError>>()?;

        let vars = info
            .vars
            .into_iter()
            .map(|(key, names)| {
                let key = parse_key(&key)?;
                let parsed = names
                    .iter()
                    .map(|n| n.parse::<TilingVar>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((key, parsed))
            })
            .collect::<Result<HashMap<_, _>, ProfileError>>()?;

        let zero_onchip_factor = info
            .zero_onchip_factor
            .map(|f| positive_u32("zero_onchip_factor", f).map(|f| f.get()))
            .transpose()?;

        Ok(CompileProfile {
            lane_count,
            dma_align,
            dtype: info.dtype,
            keep_dims: info.keep_dims,
            capabilities: Capabilities {
                atomic: info.atomic,
                transpose: info.transpose,
                group_reduce: info.group_reduce,
            },
            slots,
            shape_known: info.shape_known,
            precomputed,
            vars,
            zero_onchip_factor,
        })
    }
}

impl BudgetRow {
    /// The budget backing a variant, or `None` if the slot does not support it.
    ///
    /// Atomic runs against the rfactor table when one is present.
    pub fn for_variant(&self, variant: Variant) -> Option<u64> {
        match variant {
            Variant::Normal | Variant::Group => Some(self.normal),
            Variant::Atomic => Some(self.rfactor.unwrap_or(self.normal)),
            Variant::Padded => self.padded,
            Variant::Transposed => self.transposed,
        }
    }

    /// The smaller of the normal and rfactor budgets.
    pub fn smallest(&self) -> u64 {
        self.rfactor.map_or(self.normal, |rf| rf.min(self.normal))
    }
}

impl FromStr for TilingVar {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "_block_factor" => return Ok(TilingVar::BlockFactor),
            "_ub_factor" => return Ok(TilingVar::OnchipFactor),
            _ => {}
        }
        if let Some(idx) = s.strip_prefix("_dim_") {
            return idx
                .parse::<usize>()
                .map(TilingVar::Dim)
                .map_err(|_| ProfileError::UnknownVar(s.to_string()));
        }
        match s.strip_prefix("_attr_") {
            Some(name) if !name.is_empty() => Ok(TilingVar::Attr(name.to_string())),
            _ => Err(ProfileError::UnknownVar(s.to_string())),
        }
    }
}

impl Display for TilingVar {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TilingVar::Dim(i) => write!(f, "_dim_{i}"),
            TilingVar::BlockFactor => write!(f, "_block_factor"),
            TilingVar::OnchipFactor => write!(f, "_ub_factor"),
            TilingVar::Attr(name) => write!(f, "_attr_{name}"),
        }
    }
}

fn positive_u32(field: &'static str, value: i64) -> Result<NonZeroU32, ProfileError> {
    u32::try_from(value)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(ProfileError::NotPositive { field, value })
}

fn check_len(table: &'static str, values: &[i64], patterns: usize) -> Result<(), ProfileError> {
    if values.len() != patterns {
        return Err(ProfileError::LengthMismatch {
            table,
            len: values.len(),
            patterns,
        });
    }
    Ok(())
}

fn optional_table(
    table: &'static str,
    values: Option<&[i64]>,
    patterns: usize,
    dma_align: u32,
) -> Result<Option<Vec<Option<u64>>>, ProfileError> {
    let Some(values) = values else {
        return Ok(None);
    };
    check_len(table, values, patterns)?;
    values
        .iter()
        .enumerate()
        .map(|(slot, &value)| match value {
            v if v < 0 => Err(ProfileError::NegativeBudget { table, slot, value }),
            0 => Ok(None),
            v if v < i64::from(dma_align) => Err(ProfileError::BudgetBelowAlignment {
                table,
                slot,
                budget: v as u64,
                dma_align,
            }),
            v => Ok(Some(v as u64)),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_key(key: &str) -> Result<i32, ProfileError> {
    key.trim()
        .parse::<i32>()
        .map_err(|_| ProfileError::MalformedKey(key.to_string()))
}

#[cfg(test)]
pub(crate) fn profile_from(value: serde_json::Value) -> CompileProfile {
    let info: CompileInfo = serde_json::from_value(value).unwrap();
    CompileProfile::try_from(info).unwrap()
}
