//! Fork-join helpers used by every algorithm in the crate.
//! With the `parallel` feature disabled everything here runs on the calling thread.

use std::{cell::UnsafeCell, marker::PhantomData};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Ranges smaller than this are processed serially even when `parallel` is enabled.
pub const PARALLEL_THRESHOLD: usize = 1024;

/// Runs `f(i)` for every `i` in `0..count`.
#[inline]
pub fn par_for_each<F>(count: usize, f: F)
where
    F: Fn(usize) + Send + Sync,
{
    #[cfg(feature = "parallel")]
    if count >= PARALLEL_THRESHOLD {
        (0..count).into_par_iter().for_each(f);
        return;
    }
    (0..count).for_each(f);
}

/// Runs `a` and `b`, potentially in parallel, and returns both results.
#[inline]
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    #[cfg(feature = "parallel")]
    {
        rayon::join(a, b)
    }
    #[cfg(not(feature = "parallel"))]
    {
        (a(), b())
    }
}

/// Shared view of a mutable slice for loops where every iteration writes distinct indices.
/// The compiler can't prove that, so the accessors are `unsafe`: callers guarantee
/// no index is written by one thread while another thread reads or writes it.
pub struct UnsafeSlice<'a, T> {
    slice: &'a [UnsafeCell<T>],
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send + Sync> Send for UnsafeSlice<'_, T> {}
unsafe impl<T: Send + Sync> Sync for UnsafeSlice<'_, T> {}

impl<T> Clone for UnsafeSlice<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for UnsafeSlice<'_, T> {}

impl<'a, T> UnsafeSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        let ptr = slice as *mut [T] as *const [UnsafeCell<T>];
        Self {
            // SAFETY: `UnsafeCell<T>` has the same layout as `T`, and we hold the unique borrow for `'a`.
            slice: unsafe { &*ptr },
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.slice.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    /// # Safety
    /// No other thread may access index `i` concurrently.
    #[inline(always)]
    pub unsafe fn write(&self, i: usize, value: T) {
        *self.slice[i].get() = value;
    }

    /// # Safety
    /// No other thread may write index `i` concurrently.
    #[inline(always)]
    pub unsafe fn read(&self, i: usize) -> T
    where
        T: Copy,
    {
        *self.slice[i].get()
    }

    /// # Safety
    /// No other thread may access index `i` while the returned reference lives.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn get_mut(&self, i: usize) -> &mut T {
        &mut *self.slice[i].get()
    }

    /// # Safety
    /// No other thread may access `range` while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn slice_mut(&self, range: std::ops::Range<usize>) -> &mut [T] {
        let cells = &self.slice[range];
        std::slice::from_raw_parts_mut(cells.as_ptr() as *mut T, cells.len())
    }
}

/// Inclusive scan of `input` into `output`. Returns the total.
/// Large inputs are scanned in two parallel passes over fixed size chunks.
pub fn prefix_sum(input: &[u32], output: &mut [u32]) -> u32 {
    assert_eq!(input.len(), output.len(), "prefix_sum input and output lengths differ");
    crate::scope!("prefix_sum");

    #[cfg(feature = "parallel")]
    if input.len() >= PARALLEL_THRESHOLD * 4 {
        let chunk_size = input.len().div_ceil(rayon::current_num_threads().max(1) * 4);
        // First pass: local scans and per chunk totals.
        let mut totals: Vec<u32> = output
            .par_chunks_mut(chunk_size)
            .zip(input.par_chunks(chunk_size))
            .map(|(out, inp)| {
                let mut sum = 0;
                for (o, i) in out.iter_mut().zip(inp) {
                    sum += *i;
                    *o = sum;
                }
                sum
            })
            .collect();
        let mut sum = 0;
        for t in totals.iter_mut() {
            let v = *t;
            *t = sum;
            sum += v;
        }
        // Second pass: offset every chunk by the sum of the chunks before it.
        output
            .par_chunks_mut(chunk_size)
            .zip(totals.par_iter())
            .for_each(|(out, offset)| out.iter_mut().for_each(|o| *o += offset));
        return sum;
    }

    let mut sum = 0;
    for (o, i) in output.iter_mut().zip(input) {
        sum += *i;
        *o = sum;
    }
    sum
}

/// In place inclusive scan. Returns the total.
pub fn prefix_sum_in_place(values: &mut [u32]) -> u32 {
    let input = values.to_vec();
    prefix_sum(&input, values)
}

/// Exclusive scan of `input` into `output`. Returns the total.
pub fn exclusive_prefix_sum(input: &[u32], output: &mut [u32]) -> u32 {
    let total = prefix_sum(input, output);
    for (o, i) in output.iter_mut().zip(input) {
        *o -= *i;
    }
    total
}
