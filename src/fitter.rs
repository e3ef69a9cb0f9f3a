//! The contract between fitters and result-table writers.
//!
//! A fitter consumes one object's multi-band observation list and attaches
//! tabular results to it: one table for the object, one row per
//! observation. The schema methods let a table writer allocate storage
//! before any fit has run. Implementing [`Fitter`] requires providing every
//! operation; there is no partial implementation.

use std::fmt;
use std::str::FromStr;

use crate::cutout::Cutout;
use crate::gauss_fitter::GaussFitter;

/// Sentinel for "no result" numeric fields.
pub const DEFVAL: f64 = -9999.0;

/// Column types a fit table can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    I32,
    I64,
    F32,
    F64,
    /// Fixed-length vector of f64, one slot per band
    F64Array(usize),
}

/// One named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct FitColumn {
    pub name: String,
    pub ty: ColumnType,
}

impl FitColumn {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        FitColumn {
            name: name.to_string(),
            ty,
        }
    }
}

/// Ordered column list for one table.
pub type FitSchema = Vec<FitColumn>;

/// A single table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum FitValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    F64Array(Vec<f64>),
}

impl FitValue {
    pub fn matches(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (FitValue::I32(_), ColumnType::I32) => true,
            (FitValue::I64(_), ColumnType::I64) => true,
            (FitValue::F32(_), ColumnType::F32) => true,
            (FitValue::F64(_), ColumnType::F64) => true,
            (FitValue::F64Array(v), ColumnType::F64Array(n)) => v.len() == n,
            _ => false,
        }
    }
}

/// One row of fit output, values aligned with a schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FitRow {
    pub values: Vec<FitValue>,
}

impl FitRow {
    pub fn new(values: Vec<FitValue>) -> Self {
        FitRow { values }
    }

    /// Whether every value matches the column at its position.
    pub fn matches_schema(&self, schema: &FitSchema) -> bool {
        self.values.len() == schema.len()
            && self
                .values
                .iter()
                .zip(schema.iter())
                .all(|(v, c)| v.matches(c.ty))
    }

    /// Look up a value by column name.
    pub fn get<'a>(&'a self, schema: &FitSchema, name: &str) -> Option<&'a FitValue> {
        let pos = schema.iter().position(|c| c.name == name)?;
        self.values.get(pos)
    }
}

/// Per-observation metadata filled in by a fitter.
#[derive(Debug, Clone, Default)]
pub struct ObsMeta {
    /// Nonzero when this observation was excluded from the fit
    pub fit_flags: u32,
    /// Per-epoch result row, present after a fit with epoch data enabled
    pub epoch_fit: Option<FitRow>,
}

/// One observation of an object in one band at one epoch.
#[derive(Debug, Clone)]
pub struct Observation {
    pub image: Cutout<f32>,
    pub weight: Cutout<f32>,
    pub band: usize,
    pub cutout_index: usize,
    pub meta: ObsMeta,
}

impl Observation {
    pub fn new(image: Cutout<f32>, weight: Cutout<f32>, band: usize, cutout_index: usize) -> Self {
        Observation {
            image,
            weight,
            band,
            cutout_index,
            meta: ObsMeta::default(),
        }
    }
}

/// Object-level result container.
#[derive(Debug, Clone, Default)]
pub struct MbObsMeta {
    /// Fit result table for this object
    pub fit_data: Vec<FitRow>,
}

/// All observations of one object, grouped by band.
#[derive(Debug, Clone)]
pub struct MultiBandObsList {
    pub id: i64,
    pub bands: Vec<Vec<Observation>>,
    pub meta: MbObsMeta,
}

impl MultiBandObsList {
    pub fn new(id: i64, nband: usize) -> Self {
        MultiBandObsList {
            id,
            bands: vec![Vec::new(); nband],
            meta: MbObsMeta::default(),
        }
    }

    pub fn nband(&self) -> usize {
        self.bands.len()
    }

    pub fn push(&mut self, obs: Observation) {
        let band = obs.band;
        self.bands[band].push(obs);
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Observation> {
        self.bands.iter().flatten()
    }
}

/// Unrecoverable fitter failure.
///
/// Reserved for conditions like malformed input where no sentinel row can
/// describe the outcome. A fit that merely failed to converge is not an
/// utter failure; that is reported through flags in the result row.
#[derive(Debug)]
pub struct UtterFailure {
    msg: String,
}

impl UtterFailure {
    pub fn new(msg: impl Into<String>) -> Self {
        UtterFailure { msg: msg.into() }
    }
}

impl fmt::Display for UtterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Utter fitting failure: {}", self.msg)
    }
}

impl std::error::Error for UtterFailure {}

/// The fitting contract.
///
/// `fit` works by side effect: it attaches a result table matching
/// [`Fitter::fit_data_schema`] to the object meta, attaches a row matching
/// [`Fitter::epoch_fit_schema`] to each observation unless `make_epoch_data`
/// is false, and marks every observation excluded from the fit with a
/// nonzero `fit_flags`.
pub trait Fitter {
    /// Schema for one row of per-object output. Multi-epoch and coadd
    /// modes contribute their own column sets; with both flags set, both
    /// sets appear.
    fn fit_data_schema(&self, multi_epoch: bool, is_coadd: bool) -> FitSchema;

    /// A row of sentinel defaults matching [`Fitter::fit_data_schema`].
    fn default_fit_row(&self, multi_epoch: bool, is_coadd: bool) -> FitRow;

    /// Schema for one row of per-epoch output.
    fn epoch_fit_schema(&self) -> FitSchema;

    /// A row of sentinel defaults matching [`Fitter::epoch_fit_schema`].
    fn default_epoch_fit_row(&self) -> FitRow;

    /// Fit one object's observations.
    fn fit(
        &mut self,
        obs: &mut MultiBandObsList,
        is_coadd: bool,
        make_epoch_data: bool,
    ) -> Result<(), UtterFailure>;
}

/// Type tag selecting a concrete fitter at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitterKind {
    Gauss,
}

impl FromStr for FitterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gauss" | "gaussian" => Ok(FitterKind::Gauss),
            _ => Err(format!("Unknown fitter type: {}", s)),
        }
    }
}

impl FitterKind {
    /// Build the fitter this tag names.
    pub fn create(self, nband: usize) -> Box<dyn Fitter> {
        match self {
            FitterKind::Gauss => Box::new(GaussFitter::new(nband)),
        }
    }
}
