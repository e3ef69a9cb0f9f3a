//! A single-Gaussian fitter.
//!
//! Fits a circular Gaussian per band to all usable observations of an
//! object with a weight-aware Levenberg-Marquardt optimizer. Deliberately
//! small; it exists to exercise the fitting contract end to end and to
//! bootstrap fit-results files for the corrector.

use nalgebra::{DMatrix, DVector};

use crate::fitter::{
    ColumnType, FitColumn, FitRow, FitSchema, FitValue, Fitter, MultiBandObsList, Observation,
    UtterFailure, DEFVAL,
};

/// Row flag: no fit was attempted for this object.
pub const FIT_NO_ATTEMPT: i32 = 1;
/// Row flag: at least one band had no usable data.
pub const FIT_NO_DATA: i32 = 2;
/// Row flag: the optimizer hit its iteration limit.
pub const FIT_NOT_CONVERGED: i32 = 4;

/// Observation flag: excluded because its weight plane is all zero.
pub const OBS_NO_WEIGHT: u32 = 1;

const MAX_ITER: usize = 100;
const TOL: f64 = 1e-8;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_FACTOR: f64 = 10.0;
const LAMBDA_MAX: f64 = 1e10;
const NPARS: usize = 4;

/// Circular Gaussian: parameters `[amp, row0, col0, sigma]`.
fn model_value(p: &[f64; NPARS], row: f64, col: f64) -> f64 {
    let dr = row - p[1];
    let dc = col - p[2];
    let s2 = p[3] * p[3];
    p[0] * (-(dr * dr + dc * dc) / (2.0 * s2)).exp()
}

fn model_grad(p: &[f64; NPARS], row: f64, col: f64) -> [f64; NPARS] {
    let dr = row - p[1];
    let dc = col - p[2];
    let s2 = p[3] * p[3];
    let e = (-(dr * dr + dc * dc) / (2.0 * s2)).exp();
    [
        e,
        p[0] * e * dr / s2,
        p[0] * e * dc / s2,
        p[0] * e * (dr * dr + dc * dc) / (s2 * p[3]),
    ]
}

struct LmOutcome {
    params: [f64; NPARS],
    converged: bool,
    chi2: f64,
}

/// Weighted Levenberg-Marquardt over one band's pixel data.
fn lm_fit(
    points: &[(f64, f64)],
    values: &[f64],
    weights: &[f64],
    init: [f64; NPARS],
) -> LmOutcome {
    let n = points.len();
    let mut params = init;
    let mut lambda = LAMBDA_INIT;

    let chi2_of = |p: &[f64; NPARS]| -> f64 {
        points
            .iter()
            .zip(values)
            .zip(weights)
            .map(|(((r, c), &v), &w)| {
                let d = v - model_value(p, *r, *c);
                w * d * d
            })
            .sum()
    };

    let mut chi2 = chi2_of(&params);
    let mut converged = false;

    let mut jacobian = DMatrix::<f64>::zeros(n, NPARS);
    let mut residuals = DVector::<f64>::zeros(n);

    for _iter in 0..MAX_ITER {
        for (i, ((r, c), (&v, &w))) in points
            .iter()
            .zip(values.iter().zip(weights.iter()))
            .enumerate()
        {
            let sw = w.sqrt();
            residuals[i] = sw * (v - model_value(&params, *r, *c));
            let grad = model_grad(&params, *r, *c);
            for j in 0..NPARS {
                jacobian[(i, j)] = sw * grad[j];
            }
        }

        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let jtr = &jt * &residuals;

        let mut stepped = false;
        while lambda <= LAMBDA_MAX {
            let mut h = jtj.clone();
            for j in 0..NPARS {
                h[(j, j)] += lambda * (1.0 + jtj[(j, j)]);
            }
            let Some(delta) = h.lu().solve(&jtr) else {
                lambda *= LAMBDA_FACTOR;
                continue;
            };
            let mut trial = params;
            for j in 0..NPARS {
                trial[j] += delta[j];
            }
            trial[0] = trial[0].max(0.0);
            trial[3] = trial[3].abs().max(0.1);

            let trial_chi2 = chi2_of(&trial);
            if trial_chi2 < chi2 {
                let improvement = chi2 - trial_chi2;
                params = trial;
                chi2 = trial_chi2;
                lambda = (lambda / LAMBDA_FACTOR).max(1e-12);
                stepped = true;
                if improvement <= TOL * (1.0 + chi2) {
                    converged = true;
                }
                break;
            }
            lambda *= LAMBDA_FACTOR;
        }

        if converged || !stepped {
            // no downhill step exists at any damping: treat a clean
            // lambda exhaustion as convergence to the current minimum
            converged = converged || !stepped;
            break;
        }
    }

    LmOutcome {
        params,
        converged,
        chi2,
    }
}

/// Weighted moments used to seed the optimizer.
fn initial_guess(points: &[(f64, f64)], values: &[f64], weights: &[f64]) -> [f64; NPARS] {
    let mut wsum = 0.0;
    let mut rsum = 0.0;
    let mut csum = 0.0;
    let mut peak = 0.0f64;
    for (((r, c), &v), &w) in points.iter().zip(values).zip(weights) {
        let vw = (v * w).max(0.0);
        wsum += vw;
        rsum += vw * r;
        csum += vw * c;
        peak = peak.max(v);
    }
    if wsum <= 0.0 {
        return [peak.max(1.0), 0.0, 0.0, 2.0];
    }
    let r0 = rsum / wsum;
    let c0 = csum / wsum;
    let mut var = 0.0;
    for (((r, c), &v), &w) in points.iter().zip(values).zip(weights) {
        let vw = (v * w).max(0.0);
        var += vw * ((r - r0).powi(2) + (c - c0).powi(2));
    }
    let sigma = (var / wsum / 2.0).sqrt().clamp(0.5, 10.0);
    [peak.max(1e-6), r0, c0, sigma]
}

pub struct GaussFitter {
    nband: usize,
}

impl GaussFitter {
    pub fn new(nband: usize) -> Self {
        GaussFitter { nband }
    }

    fn band_columns(prefix: &str, nband: usize) -> FitSchema {
        vec![
            FitColumn::new(&format!("{}flux", prefix), ColumnType::F64Array(nband)),
            FitColumn::new(&format!("{}flux_err", prefix), ColumnType::F64Array(nband)),
            FitColumn::new(&format!("{}t", prefix), ColumnType::F64),
            FitColumn::new(&format!("{}chi2per", prefix), ColumnType::F64),
            FitColumn::new(&format!("{}nuse", prefix), ColumnType::I32),
        ]
    }

    fn band_defaults(nband: usize) -> Vec<FitValue> {
        vec![
            FitValue::F64Array(vec![DEFVAL; nband]),
            FitValue::F64Array(vec![DEFVAL; nband]),
            FitValue::F64(DEFVAL),
            FitValue::F64(DEFVAL),
            FitValue::I32(0),
        ]
    }

    /// Pixel data for one band, pooled over its usable observations.
    fn band_points(obs_list: &[Observation]) -> (Vec<(f64, f64)>, Vec<f64>, Vec<f64>) {
        let mut points = Vec::new();
        let mut values = Vec::new();
        let mut weights = Vec::new();
        for obs in obs_list {
            if obs.meta.fit_flags != 0 {
                continue;
            }
            let size = obs.image.size();
            let center = (size as f64 - 1.0) / 2.0;
            for row in 0..size {
                for col in 0..size {
                    let w = obs.weight.get(row, col) as f64;
                    if w > 0.0 {
                        points.push((row as f64 - center, col as f64 - center));
                        values.push(obs.image.get(row, col) as f64);
                        weights.push(w);
                    }
                }
            }
        }
        (points, values, weights)
    }

    /// Moment flux for one observation, for the per-epoch table.
    fn epoch_row(&self, obs: &Observation) -> FitRow {
        let mut flux = 0.0f64;
        let mut var = 0.0f64;
        let mut npix = 0i32;
        for (i, &w) in obs.weight.as_slice().iter().enumerate() {
            if w > 0.0 {
                flux += obs.image.as_slice()[i] as f64;
                var += 1.0 / w as f64;
                npix += 1;
            }
        }
        FitRow::new(vec![
            FitValue::I32(obs.band as i32),
            FitValue::I32(obs.cutout_index as i32),
            FitValue::I32(npix),
            FitValue::F64(flux),
            FitValue::F64(var.sqrt()),
            FitValue::I32(0),
        ])
    }
}

impl Fitter for GaussFitter {
    fn fit_data_schema(&self, multi_epoch: bool, is_coadd: bool) -> FitSchema {
        let mut schema = vec![FitColumn::new("flags", ColumnType::I32)];
        if is_coadd {
            schema.extend(Self::band_columns("coadd_", self.nband));
        }
        if multi_epoch {
            schema.extend(Self::band_columns("", self.nband));
        }
        schema
    }

    fn default_fit_row(&self, multi_epoch: bool, is_coadd: bool) -> FitRow {
        let mut values = vec![FitValue::I32(FIT_NO_ATTEMPT)];
        if is_coadd {
            values.extend(Self::band_defaults(self.nband));
        }
        if multi_epoch {
            values.extend(Self::band_defaults(self.nband));
        }
        FitRow::new(values)
    }

    fn epoch_fit_schema(&self) -> FitSchema {
        vec![
            FitColumn::new("band", ColumnType::I32),
            FitColumn::new("cutout_index", ColumnType::I32),
            FitColumn::new("npix_use", ColumnType::I32),
            FitColumn::new("flux", ColumnType::F64),
            FitColumn::new("flux_err", ColumnType::F64),
            FitColumn::new("flags", ColumnType::I32),
        ]
    }

    fn default_epoch_fit_row(&self) -> FitRow {
        FitRow::new(vec![
            FitValue::I32(-1),
            FitValue::I32(-1),
            FitValue::I32(0),
            FitValue::F64(DEFVAL),
            FitValue::F64(DEFVAL),
            FitValue::I32(FIT_NO_ATTEMPT),
        ])
    }

    fn fit(
        &mut self,
        obs: &mut MultiBandObsList,
        is_coadd: bool,
        make_epoch_data: bool,
    ) -> Result<(), UtterFailure> {
        if obs.nband() != self.nband {
            return Err(UtterFailure::new(format!(
                "object {} has {} bands, fitter configured for {}",
                obs.id,
                obs.nband(),
                self.nband
            )));
        }
        for ob in obs.iter_all() {
            if ob.image.size() != ob.weight.size() {
                return Err(UtterFailure::new(format!(
                    "object {} band {} cutout {}: image size {} but weight size {}",
                    obs.id,
                    ob.band,
                    ob.cutout_index,
                    ob.image.size(),
                    ob.weight.size()
                )));
            }
            if ob.band >= self.nband {
                return Err(UtterFailure::new(format!(
                    "object {} has an observation in band {} of {}",
                    obs.id, ob.band, self.nband
                )));
            }
        }

        // exclusion: an observation with no usable weight never enters
        for band_obs in obs.bands.iter_mut() {
            for ob in band_obs.iter_mut() {
                if !ob.weight.iter().any(|&w| w > 0.0) {
                    ob.meta.fit_flags |= OBS_NO_WEIGHT;
                }
            }
        }

        let mut flags = 0i32;
        let mut flux = vec![DEFVAL; self.nband];
        let mut flux_err = vec![DEFVAL; self.nband];
        let mut t = DEFVAL;
        let mut chi2per = DEFVAL;
        let mut nuse = 0i32;

        for (band, band_obs) in obs.bands.iter().enumerate() {
            let (points, values, weights) = Self::band_points(band_obs);
            if points.len() < NPARS {
                flags |= FIT_NO_DATA;
                continue;
            }
            let outcome = lm_fit(&points, &values, &weights, initial_guess(&points, &values, &weights));
            if !outcome.converged {
                flags |= FIT_NOT_CONVERGED;
            }
            let [amp, _r0, _c0, sigma] = outcome.params;
            flux[band] = amp * 2.0 * std::f64::consts::PI * sigma * sigma;
            flux_err[band] = {
                let var: f64 = weights.iter().map(|&w| 1.0 / w).sum();
                var.sqrt()
            };
            // one size and one goodness value per object, from the last
            // band with data, matching the single-size model
            t = 2.0 * sigma * sigma;
            let dof = (points.len() - NPARS).max(1) as f64;
            chi2per = outcome.chi2 / dof;
            nuse += band_obs.iter().filter(|o| o.meta.fit_flags == 0).count() as i32;
        }

        let multi_epoch = !is_coadd;
        let schema = self.fit_data_schema(multi_epoch, is_coadd);
        let mut row = self.default_fit_row(multi_epoch, is_coadd);
        row.values[0] = FitValue::I32(flags);
        // both modes carry the same five band columns after the flags
        row.values[1] = FitValue::F64Array(flux);
        row.values[2] = FitValue::F64Array(flux_err);
        row.values[3] = FitValue::F64(t);
        row.values[4] = FitValue::F64(chi2per);
        row.values[5] = FitValue::I32(nuse);
        debug_assert!(row.matches_schema(&schema));
        obs.meta.fit_data = vec![row];

        if make_epoch_data {
            let default_row = self.default_epoch_fit_row();
            for band_obs in obs.bands.iter_mut() {
                for ob in band_obs.iter_mut() {
                    ob.meta.epoch_fit = if ob.meta.fit_flags == 0 {
                        Some(self.epoch_row(ob))
                    } else {
                        Some(default_row.clone())
                    };
                }
            }
        }
        Ok(())
    }
}
