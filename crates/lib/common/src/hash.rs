// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
};

use siphasher::sip::SipHasher13;

/// Hasher used for every content-addressed key.
///
/// Keys are fixed, so the same descriptor produces the same value across runs and
/// across threads. Field order matters, `(a, b)` and `(b, a)` hash differently.
pub type ContentHasher = SipHasher13;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildContentHasher;

impl BuildHasher for BuildContentHasher {
    type Hasher = ContentHasher;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher13::new_with_keys(0, 0)
    }
}

/// Map keyed by full descriptor value. Lookup hashes with [`ContentHasher`] and
/// compares keys for equality on hash match, so colliding descriptors never alias.
pub type ContentMap<K, V> = HashMap<K, V, BuildContentHasher>;

pub fn content_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = BuildContentHasher.build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}
