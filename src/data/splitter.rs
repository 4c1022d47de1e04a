// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Two ways to hold slides out for validation:
//
//   split_train_val   → seeded shuffle, then cut at a fraction
//   stratified_folds  → k folds with the same grade mix
//
// Stratified folds matter here because ISUP grades are badly
// imbalanced (many grade 0/1 slides, few grade 5). A purely
// random fold can end up with almost no high-grade slides, and
// kappa on that fold says little.
//
// Fold assignment:
//   1. Group items by stratum (the slide grade)
//   2. Shuffle each group with the seeded RNG
//   3. Deal each group round-robin across the k folds,
//      continuing the rotation from group to group so fold
//      sizes differ by at most one
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom.
//
// Reference: rand crate documentation

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Shuffle `samples` with a fixed seed and split into (train, validation).
pub fn split_train_val<T>(mut samples: Vec<T>, train_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let total    = samples.len();
    let split_at = ((total as f64) * train_fraction).round() as usize;
    let split_at = split_at.min(total);
    let val      = samples.split_off(split_at);

    tracing::debug!(
        "Dataset split: {} training, {} validation",
        samples.len(),
        val.len(),
    );
    (samples, val)
}

/// Fold index (0..n_folds) for every item, stratified by `stratum`.
pub fn stratified_folds<T, K, F>(items: &[T], n_folds: usize, seed: u64, stratum: F) -> Vec<usize>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        groups.entry(stratum(item)).or_default().push(i);
    }

    let mut rng   = StdRng::seed_from_u64(seed);
    let mut folds = vec![0usize; items.len()];
    let mut next  = 0usize;
    for indices in groups.values_mut() {
        indices.shuffle(&mut rng);
        for &i in indices.iter() {
            folds[i] = next % n_folds.max(1);
            next += 1;
        }
    }
    folds
}

/// Split into (train, validation) where fold `fold` is validation.
pub fn fold_split<T, K, F>(
    items:   Vec<T>,
    n_folds: usize,
    fold:    usize,
    seed:    u64,
    stratum: F,
) -> Result<(Vec<T>, Vec<T>), ConfigError>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    if n_folds < 2 || fold >= n_folds {
        return Err(ConfigError::InvalidFold { fold, n_folds });
    }
    let assignment = stratified_folds(&items, n_folds, seed, stratum);
    let (mut train, mut val) = (Vec::new(), Vec::new());
    for (item, f) in items.into_iter().zip(assignment) {
        if f == fold {
            val.push(item);
        } else {
            train.push(item);
        }
    }
    tracing::debug!(
        "Fold {}/{}: {} training, {} validation",
        fold, n_folds, train.len(), val.len()
    );
    Ok((train, val))
}
