//! Passes that prune the scored peak groups of one spectrum down to a non-redundant set.
//!
//! Each pass takes ownership of the peak groups and returns the survivors ordered by
//! monoisotopic mass.

use std::collections::HashMap;

use crossbeam_channel::unbounded;
use identity_hash::BuildIdentityHasher;
use mzpeaks::IndexType;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::charge::HARMONIC_CHARGES;
use crate::peak_group::{PeakGroup, ScoringContext};
use crate::peaks::charge_mass;
use crate::scorer::ScoreType;

/// A peak group claiming a shared peak keeps it if its charge's SNR is this many times
/// larger than the competing claim's
pub const CHARGE_ERROR_SNR_RATIO: ScoreType = 2.0;

/// Peak groups above this SNR never have their shared peaks counted against them
pub const CHARGE_ERROR_PROTECTED_SNR: ScoreType = 10.0;

/// The fraction of a peak group's intensity that may come from disputed peaks
pub const CHARGE_ERROR_INTENSITY_FRACTION: f32 = 0.5;

fn sort_by_mass(groups: &mut [PeakGroup]) {
    groups.sort_by(|a, b| a.mass_cmp(b));
}

fn is_within(a: f64, b: f64, relative_tolerance: f64) -> bool {
    (a - b).abs() <= a.max(b) * relative_tolerance
}

/// Keep only the best peak group in every mass neighborhood.
///
/// Peak groups are visited from highest to lowest SNR, targeted groups first, and a group is
/// kept when no kept group lies within `relative_tolerance` of its mass. Targeted groups are
/// always kept. Applying this to its own output changes nothing.
pub fn remove_overlapping_peak_groups(
    groups: Vec<PeakGroup>,
    relative_tolerance: f64,
) -> Vec<PeakGroup> {
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|i, j| {
        let (a, b) = (&groups[*i], &groups[*j]);
        b.targeted
            .cmp(&a.targeted)
            .then(b.snr.total_cmp(&a.snr))
            .then(a.mass_cmp(b))
    });

    let mut accepted_masses: Vec<f64> = Vec::with_capacity(groups.len());
    let mut keep = vec![false; groups.len()];
    for i in order {
        let mass = groups[i].monoisotopic_mass();
        let at = accepted_masses.partition_point(|m| *m < mass);
        let conflict = accepted_masses
            .get(at)
            .into_iter()
            .chain(at.checked_sub(1).and_then(|k| accepted_masses.get(k)))
            .any(|m| is_within(*m, mass, relative_tolerance));
        if conflict && !groups[i].targeted {
            trace!("Dropping overlapping peak group at {mass:.4}");
            continue;
        }
        accepted_masses.insert(at, mass);
        keep[i] = true;
    }

    let n_before = groups.len();
    let mut kept: Vec<PeakGroup> = groups
        .into_iter()
        .zip(keep)
        .filter_map(|(g, k)| k.then_some(g))
        .collect();
    sort_by_mass(&mut kept);
    debug!(
        "Overlap removal at {relative_tolerance:e} kept {} of {n_before} peak groups",
        kept.len()
    );
    kept
}

/// Drop peak groups that explain too much of their intensity with peaks another group
/// claims under a different charge, and peak groups whose representative charge falls
/// outside of the allowed charge range.
///
/// For each shared peak, every claimant's charge for that peak is inferred from its mass.
/// A claimant is disputed unless its SNR at that charge is [`CHARGE_ERROR_SNR_RATIO`] times
/// that of every competing claim, or its total SNR exceeds [`CHARGE_ERROR_PROTECTED_SNR`].
/// Groups whose disputed intensity reaches [`CHARGE_ERROR_INTENSITY_FRACTION`] of their total
/// are dropped unless targeted. The lower charge bound only applies at MS level 1.
pub fn remove_charge_error_peak_groups(
    groups: Vec<PeakGroup>,
    min_abs_charge: i32,
    max_abs_charge: i32,
    ms_level: u8,
) -> Vec<PeakGroup> {
    let mut claims: HashMap<IndexType, Vec<usize>, BuildIdentityHasher<IndexType>> =
        HashMap::default();
    let mut peak_info: HashMap<IndexType, (f64, f32), BuildIdentityHasher<IndexType>> =
        HashMap::default();
    for (i, pg) in groups.iter().enumerate() {
        for p in pg.peaks() {
            let claimants = claims.entry(p.index).or_default();
            if claimants.last() != Some(&i) {
                claimants.push(i);
            }
            peak_info.insert(p.index, (p.mz, p.intensity));
        }
    }

    let mut peak_indices: Vec<IndexType> = claims.keys().copied().collect();
    peak_indices.sort_unstable();

    let mut disputed_intensity = vec![0.0f32; groups.len()];
    for peak_index in peak_indices {
        let claimants = &claims[&peak_index];
        if claimants.len() < 2 {
            continue;
        }
        let (mz, intensity) = peak_info[&peak_index];
        for i in claimants.iter().copied() {
            let a = &groups[i];
            if a.snr() > CHARGE_ERROR_PROTECTED_SNR {
                continue;
            }
            let z1 = (a.monoisotopic_mass() / (mz - charge_mass(a.is_positive()))).round() as i32;
            let disputed = claimants.iter().copied().filter(|j| *j != i).any(|j| {
                let b = &groups[j];
                let z2 =
                    (b.monoisotopic_mass() / (mz - charge_mass(b.is_positive()))).round() as i32;
                z1 != z2 && a.charge_snr(z1) <= b.charge_snr(z2) * CHARGE_ERROR_SNR_RATIO
            });
            if disputed {
                disputed_intensity[i] += intensity;
            }
        }
    }

    let n_before = groups.len();
    let kept: Vec<PeakGroup> = groups
        .into_iter()
        .zip(disputed_intensity)
        .filter(|(pg, disputed)| {
            if !pg.targeted && *disputed >= pg.intensity() * CHARGE_ERROR_INTENSITY_FRACTION {
                trace!(
                    "Dropping {:.4} with {disputed} of {} intensity disputed",
                    pg.monoisotopic_mass(),
                    pg.intensity()
                );
                return false;
            }
            let z = pg.representative_abs_charge();
            !((ms_level == 1 && z < min_abs_charge) || z > max_abs_charge)
        })
        .map(|(pg, _)| pg)
        .collect();
    debug!(
        "Charge error removal kept {} of {n_before} peak groups",
        kept.len()
    );
    kept
}

/// Drop peak groups within `relative_tolerance` of any mass in `excluded_masses`, which
/// must be sorted. Targeted groups are kept.
pub fn remove_excluded_masses(
    groups: Vec<PeakGroup>,
    excluded_masses: &[f64],
    relative_tolerance: f64,
) -> Vec<PeakGroup> {
    if excluded_masses.is_empty() {
        return groups;
    }
    let n_before = groups.len();
    let kept: Vec<PeakGroup> = groups
        .into_iter()
        .filter(|pg| {
            let mass = pg.monoisotopic_mass();
            let delta = mass * relative_tolerance;
            let start = excluded_masses.partition_point(|m| *m < mass - delta);
            let excluded = excluded_masses[start..]
                .iter()
                .take_while(|m| **m <= mass + delta)
                .next()
                .is_some();
            pg.targeted || !excluded
        })
        .collect();
    debug!(
        "Excluded mass removal kept {} of {n_before} peak groups",
        kept.len()
    );
    kept
}

/// Score the harmonic hypotheses of `group`: the mass multiplied by each harmonic charge
/// over the correspondingly multiplied charges, and the mass divided by it over the divided
/// charges where at least charge 1 remains.
pub fn harmonic_hypotheses(group: &PeakGroup, ctx: &ScoringContext) -> Vec<PeakGroup> {
    let mass = group.monoisotopic_mass();
    let (lo, hi) = group.charge_range();
    let mut hypotheses = Vec::new();
    for h in HARMONIC_CHARGES {
        let up = (lo * h, (hi * h).min(ctx.max_abs_charge));
        if up.0 <= up.1 {
            hypotheses.push(PeakGroup::with_mass(
                mass * h as f64,
                up.0,
                up.1,
                group.is_positive(),
            ));
        }
        let down = ((lo / h).max(1), hi / h);
        if down.1 >= 1 {
            hypotheses.push(PeakGroup::with_mass(
                mass / h as f64,
                down.0,
                down.1,
                group.is_positive(),
            ));
        }
    }
    hypotheses
        .into_iter()
        .map(|hypothesis| {
            let recruitment = hypothesis.recruit_all_peaks(ctx, hypothesis.monoisotopic_mass());
            hypothesis.update_scores(recruitment, ctx).0
        })
        .collect()
}

/// Drop every peak group for which some harmonic hypothesis of it, rescored against the
/// spectrum, has an acceptable isotope cosine and a higher SNR. Targeted groups are kept.
///
/// Groups are evaluated in parallel and the verdicts collected by index, so the result does
/// not depend on scheduling.
pub fn remove_harmonic_peak_groups(groups: Vec<PeakGroup>, ctx: &ScoringContext) -> Vec<PeakGroup> {
    let (sender, receiver) = unbounded();
    groups
        .par_iter()
        .enumerate()
        .for_each_with(sender, |sender, (i, pg)| {
            let is_harmonic = !pg.targeted
                && harmonic_hypotheses(pg, ctx).iter().any(|h| {
                    h.isotope_cosine() >= ctx.min_isotope_cosine && h.snr() > pg.snr()
                });
            if sender.send((i, is_harmonic)).is_err() {
                tracing::warn!("Harmonic verdict for peak group {i} was not received");
            }
        });

    let mut is_harmonic = vec![false; groups.len()];
    for (i, verdict) in receiver.iter() {
        is_harmonic[i] = verdict;
    }

    let n_before = groups.len();
    let mut kept: Vec<PeakGroup> = groups
        .into_iter()
        .zip(is_harmonic)
        .filter_map(|(pg, harmonic)| {
            if harmonic {
                trace!("Dropping harmonic peak group at {:.4}", pg.monoisotopic_mass());
                None
            } else {
                Some(pg)
            }
        })
        .collect();
    sort_by_mass(&mut kept);
    debug!(
        "Harmonic removal kept {} of {n_before} peak groups",
        kept.len()
    );
    kept
}
