mod frame_pacer;

pub use self::frame_pacer::*;

use std::{fmt, marker::PhantomData, ops};

pub fn align_to(offset: u64, alignment: u64) -> u64 {
    let rem = offset & (alignment - 1);
    if rem == 0 {
        offset
    } else {
        offset - rem + alignment
    }
}

/// Read the `index`-th element of a tightly packed array of `T`.
pub fn read_pod<T: bytemuck::Pod>(bytes: &[u8], index: usize) -> Option<T> {
    let size = std::mem::size_of::<T>();
    bytes
        .get(index * size..(index + 1) * size)
        .map(bytemuck::pod_read_unaligned)
}

/// Closed enumeration usable as a dense array key.
pub trait EnumKey: Copy + strum::IntoEnumIterator + strum::EnumCount {
    fn index(self) -> usize;
}

macro_rules! impl_enum_key {
    ($($ty:ty),*) => {
        $(
            impl $crate::util::EnumKey for $ty {
                fn index(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}
pub(crate) use impl_enum_key;

/// Array with one value per variant of `K`.
pub struct EnumArray<K, V> {
    values: Vec<V>,
    _key: PhantomData<K>,
}

impl<K: EnumKey, V> EnumArray<K, V> {
    pub fn from_fn(mut fun: impl FnMut(K) -> V) -> Self {
        Self {
            values: K::iter().map(&mut fun).collect(),
            _key: PhantomData,
        }
    }

    /// Build from a fallible constructor, stopping at the first error.
    pub fn try_from_fn<E>(mut fun: impl FnMut(K) -> Result<V, E>) -> Result<Self, (Vec<V>, E)> {
        let mut values = Vec::with_capacity(K::COUNT);
        for key in K::iter() {
            match fun(key) {
                Ok(value) => values.push(value),
                Err(e) => return Err((values, e)),
            }
        }
        Ok(Self {
            values,
            _key: PhantomData,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        K::iter().zip(self.values.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.values.iter()
    }

    pub fn into_values(self) -> impl Iterator<Item = V> {
        self.values.into_iter()
    }
}

impl<K: EnumKey, V: Default> Default for EnumArray<K, V> {
    fn default() -> Self {
        Self::from_fn(|_| V::default())
    }
}

impl<K: EnumKey, V: Clone> Clone for EnumArray<K, V> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            _key: PhantomData,
        }
    }
}

impl<K: EnumKey + fmt::Debug, V: fmt::Debug> fmt::Debug for EnumArray<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: EnumKey, V> ops::Index<K> for EnumArray<K, V> {
    type Output = V;
    fn index(&self, key: K) -> &V {
        &self.values[key.index()]
    }
}

impl<K: EnumKey, V> ops::IndexMut<K> for EnumArray<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.values[key.index()]
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn alignment() {
        assert_eq!(super::align_to(0, 32), 0);
        assert_eq!(super::align_to(33, 32), 64);
        assert_eq!(super::align_to(64, 32), 64);
    }

    #[test]
    fn pod_reads() {
        let bytes = bytemuck::cast_slice::<u32, u8>(&[3, 5, 7]).to_vec();
        assert_eq!(super::read_pod::<u32>(&bytes[4..], 1), Some(7));
        assert_eq!(super::read_pod::<u32>(&bytes, 3), None);
    }
}
