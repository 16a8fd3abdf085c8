use rayon::iter::{IntoParallelIterator, ParallelIterator as _};

pub use merge::Merge;

/// Folds items on the rayon pool and merges the partial accumulators.
///
/// Partial results are merged left to right, so for indexed inputs the
/// result matches a sequential fold over the same items.
pub fn par_fold_reduce<Acc, T, E>(
    iter: impl IntoParallelIterator<Item = T>,
    f: impl Fn(&mut Acc, T) -> Result<(), E> + Send + Sync,
) -> Result<Acc, E>
where
    Acc: Merge + Default + Send + Sync,
    E: Send,
{
    iter.into_par_iter()
        .try_fold(Acc::default, |mut acc, item| -> Result<_, E> {
            f(&mut acc, item)?;
            Ok(acc)
        })
        .try_reduce(Acc::default, |mut acc, item| {
            Merge::merge(&mut acc, item);
            Ok(acc)
        })
}

mod merge {
    use std::collections::BTreeMap;

    pub trait Merge {
        fn merge(&mut self, other: Self);
    }

    impl Merge for usize {
        fn merge(&mut self, other: Self) {
            *self += other;
        }
    }

    impl<T> Merge for Vec<T> {
        fn merge(&mut self, other: Self) {
            self.extend(other);
        }
    }

    // `other` holds the later items, values for shared keys are merged in that order
    impl<K, V> Merge for BTreeMap<K, V>
    where
        K: Ord,
        V: Merge,
    {
        fn merge(&mut self, other: Self) {
            use std::collections::btree_map::Entry;
            for (key, value) in other {
                match self.entry(key) {
                    Entry::Vacant(entry) => drop(entry.insert(value)),
                    Entry::Occupied(mut entry) => entry.get_mut().merge(value),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn par_fold_matches_sequential_order() {
        let items: Vec<(u32, usize)> = (0..2000).map(|i| (i % 7, i as usize)).collect();

        let par = par_fold_reduce(items.clone(), |acc: &mut BTreeMap<u32, Vec<usize>>, (k, v)| {
            acc.entry(k).or_default().push(v);
            Ok::<_, ()>(())
        })
        .unwrap();

        let mut seq = BTreeMap::<u32, Vec<usize>>::new();
        for (k, v) in items {
            seq.entry(k).or_default().push(v);
        }
        assert_eq!(par, seq);
    }

    #[test]
    fn par_fold_propagates_errors() {
        let result = par_fold_reduce(0..100usize, |acc: &mut usize, i| {
            if i == 42 {
                return Err("boom");
            }
            *acc += 1;
            Ok(())
        });
        assert_eq!(result, Err("boom"));
    }
}
