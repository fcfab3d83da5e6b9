//! Key/value sorting on top of `rdst`. Keys are unsigned integers, values are u32 indices.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "parallel")]
use rdst::tuner::{Algorithm, Tuner, TuningParams};
use rdst::{RadixKey, RadixSort};

/// A sort key and the index it belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KeyValue<K> {
    pub key: K,
    pub value: u32,
}

impl<K: RadixKey> RadixKey for KeyValue<K> {
    const LEVELS: usize = K::LEVELS;

    #[inline(always)]
    fn get_level(&self, level: usize) -> u8 {
        self.key.get_level(level)
    }
}

/// Keys that can be radix sorted.
pub trait SortKey: RadixKey + Ord + Copy + Default + Send + Sync {}

impl SortKey for u32 {}
impl SortKey for u64 {}

/// Sorts pairs by key, ascending. The relative order of equal keys is unspecified.
pub fn sort_pairs<K: SortKey>(pairs: &mut [KeyValue<K>]) {
    crate::scope!("sort_pairs");
    if pairs.len() <= 128 {
        pairs.sort_unstable_by_key(|p| p.key);
        return;
    }
    #[cfg(feature = "parallel")]
    {
        pairs.radix_sort_builder().with_tuner(&SortTuner {}).sort();
    }
    #[cfg(not(feature = "parallel"))]
    {
        pairs.radix_sort_unstable();
    }
}

/// Sorts `keys` ascending and applies the same permutation to `values`.
pub fn sort_by_key<K: SortKey>(keys: &mut [K], values: &mut [u32]) {
    assert_eq!(keys.len(), values.len(), "sort_by_key needs one value per key");
    let mut pairs: Vec<KeyValue<K>> = keys
        .iter()
        .zip(values.iter())
        .map(|(&key, &value)| KeyValue { key, value })
        .collect();
    sort_pairs(&mut pairs);

    let unpack = |((k, v), p): ((&mut K, &mut u32), &KeyValue<K>)| {
        *k = p.key;
        *v = p.value;
    };
    #[cfg(feature = "parallel")]
    if pairs.len() >= crate::parallel::PARALLEL_THRESHOLD {
        keys.par_iter_mut()
            .zip(values.par_iter_mut())
            .zip(pairs.par_iter())
            .for_each(unpack);
        return;
    }
    keys.iter_mut()
        .zip(values.iter_mut())
        .zip(pairs.iter())
        .for_each(unpack);
}

/// Indices `0..keys.len()` ordered by their key.
pub fn sorted_indices<K: SortKey>(keys: &[K]) -> Vec<u32> {
    let mut pairs: Vec<KeyValue<K>> = keys
        .iter()
        .enumerate()
        .map(|(i, &key)| KeyValue { key, value: i as u32 })
        .collect();
    sort_pairs(&mut pairs);
    pairs.into_iter().map(|p| p.value).collect()
}

#[cfg(feature = "parallel")]
struct SortTuner;

#[cfg(feature = "parallel")]
impl Tuner for SortTuner {
    fn pick_algorithm(&self, p: &TuningParams, _counts: &[usize]) -> Algorithm {
        if p.input_len <= 128 {
            return Algorithm::Comparative;
        }

        match p.input_len {
            0..=20_000 => Algorithm::Ska,
            _ => Algorithm::Regions,
        }
    }
}
