//! Keys, key ranges and key sets.
//!
//! A [`Key`] is a tuple of values, each tagged with a sort direction, so that
//! a single forward scan of a BTreeMap yields rows in the declared index
//! order. Descending parts compare in reverse; NULL stays the smallest value
//! in ascending order and therefore the largest in descending order.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// Sort direction of one key part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest value first.
    #[default]
    Ascending,
    /// Largest value first.
    Descending,
}

/// One component of a key: a value plus its sort direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPart {
    /// The component value.
    pub value: Value,
    /// How this component participates in key ordering.
    pub order: SortOrder,
}

impl KeyPart {
    /// An ascending part.
    pub fn asc(value: Value) -> Self {
        KeyPart {
            value,
            order: SortOrder::Ascending,
        }
    }

    /// A descending part.
    pub fn desc(value: Value) -> Self {
        KeyPart {
            value,
            order: SortOrder::Descending,
        }
    }

    fn cmp_part(&self, other: &KeyPart) -> Ordering {
        let ord = self.value.cmp(&other.value);
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

/// A row or index-entry key.
///
/// Keys compare part by part. When one key is a strict prefix of another the
/// shorter key sorts first, unless it was produced by [`Key::prefix_limit`],
/// in which case it sorts after every key it prefixes. That gives a cheap
/// exclusive upper bound for prefix scans without inventing sentinel values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    parts: Vec<KeyPart>,
    prefix_limit: bool,
}

impl Key {
    /// An all-ascending key over `values`.
    pub fn new(values: Vec<Value>) -> Self {
        Key {
            parts: values.into_iter().map(KeyPart::asc).collect(),
            prefix_limit: false,
        }
    }

    /// A key from explicitly directed parts.
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Key {
            parts,
            prefix_limit: false,
        }
    }

    /// The empty key (prefix of every key).
    pub fn empty() -> Self {
        Key::new(Vec::new())
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the key has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The directed parts of this key.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// The value of part `i`.
    pub fn value(&self, i: usize) -> &Value {
        &self.parts[i].value
    }

    /// Append a part.
    pub fn push(&mut self, part: KeyPart) {
        self.parts.push(part);
    }

    /// A key holding only the first `n` parts.
    pub fn prefix(&self, n: usize) -> Key {
        Key {
            parts: self.parts[..n.min(self.parts.len())].to_vec(),
            prefix_limit: false,
        }
    }

    /// The least key greater than every key having `self` as a prefix.
    /// Use as an exclusive upper bound for prefix scans.
    pub fn prefix_limit(&self) -> Key {
        Key {
            parts: self.parts.clone(),
            prefix_limit: true,
        }
    }

    /// Whether this key was produced by [`Key::prefix_limit`].
    pub fn is_prefix_limit(&self) -> bool {
        self.prefix_limit
    }

    /// Re-tag the parts with a keyspace's sort orders, position by position.
    /// Caller-supplied keys default to all-ascending; they must be aligned
    /// with the target keyspace before comparing against stored keys.
    /// Returns `None` when the key has more parts than the keyspace.
    pub fn with_orders(&self, orders: &[SortOrder]) -> Option<Key> {
        if self.parts.len() > orders.len() {
            return None;
        }
        Some(Key {
            parts: self
                .parts
                .iter()
                .zip(orders)
                .map(|(part, &order)| KeyPart {
                    value: part.value.clone(),
                    order,
                })
                .collect(),
            prefix_limit: self.prefix_limit,
        })
    }

    /// Whether `other` starts with this key's parts (directions ignored;
    /// the caller guarantees both keys come from the same keyspace).
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        self.parts.len() <= other.parts.len()
            && self
                .parts
                .iter()
                .zip(&other.parts)
                .all(|(a, b)| a.value == b.value)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(&other.parts) {
            let ord = a.cmp_part(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        match self.parts.len().cmp(&other.parts.len()) {
            Ordering::Equal => self.prefix_limit.cmp(&other.prefix_limit),
            Ordering::Less => {
                if self.prefix_limit {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            Ordering::Greater => {
                if other.prefix_limit {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part.value)?;
        }
        if self.prefix_limit {
            write!(f, ", <limit>")?;
        }
        write!(f, "]")
    }
}

/// A contiguous range of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Lower bound.
    pub start: Bound<Key>,
    /// Upper bound.
    pub end: Bound<Key>,
}

impl KeyRange {
    /// The range covering every key.
    pub fn all() -> Self {
        KeyRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// The single-key range `[key, key]`.
    pub fn point(key: Key) -> Self {
        KeyRange {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    /// `[start, end]`.
    pub fn closed(start: Key, end: Key) -> Self {
        KeyRange {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// `[start, end)`.
    pub fn closed_open(start: Key, end: Key) -> Self {
        KeyRange {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    /// Every key having `prefix` as a prefix.
    pub fn prefix(prefix: Key) -> Self {
        let limit = prefix.prefix_limit();
        KeyRange {
            start: Bound::Included(prefix),
            end: Bound::Excluded(limit),
        }
    }

    /// Build from explicit endpoints and inclusivity flags.
    pub fn from_flags(start: Key, end: Key, start_inclusive: bool, end_inclusive: bool) -> Self {
        KeyRange {
            start: if start_inclusive {
                Bound::Included(start)
            } else {
                Bound::Excluded(start)
            },
            end: if end_inclusive {
                Bound::Included(end)
            } else {
                Bound::Excluded(end)
            },
        }
    }

    /// Borrowed bounds suitable for `BTreeMap::range`.
    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (bound_as_ref(&self.start), bound_as_ref(&self.end))
    }

    /// Whether the range contains no keys at all.
    pub fn is_empty(&self) -> bool {
        let (start, inc_start) = match &self.start {
            Bound::Unbounded => return false,
            Bound::Included(k) => (k, true),
            Bound::Excluded(k) => (k, false),
        };
        let (end, inc_end) = match &self.end {
            Bound::Unbounded => return false,
            Bound::Included(k) => (k, true),
            Bound::Excluded(k) => (k, false),
        };
        match start.cmp(end) {
            Ordering::Less => false,
            Ordering::Equal => !(inc_start && inc_end),
            Ordering::Greater => true,
        }
    }

    /// Whether `key` lies inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(k) => key >= k,
            Bound::Excluded(k) => key > k,
        };
        let before_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(k) => key <= k,
            Bound::Excluded(k) => key < k,
        };
        after_start && before_end
    }
}

fn bound_as_ref(b: &Bound<Key>) -> Bound<&Key> {
    match b {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(k),
        Bound::Excluded(k) => Bound::Excluded(k),
    }
}

/// Order two start bounds. `Unbounded` is the smallest start; at the same
/// key an inclusive start precedes an exclusive one.
fn cmp_start(a: &Bound<Key>, b: &Bound<Key>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Greater),
    }
}

/// Order two end bounds. `Unbounded` is the largest end; at the same key an
/// inclusive end extends further than an exclusive one.
fn cmp_end(a: &Bound<Key>, b: &Bound<Key>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Less),
    }
}

/// Whether a range ending at `end` touches or overlaps a range starting at
/// `start`, i.e. their union is still contiguous.
fn joinable(end: &Bound<Key>, start: &Bound<Key>) -> bool {
    match (end, start) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(e), Bound::Included(s))
        | (Bound::Included(e), Bound::Excluded(s))
        | (Bound::Excluded(e), Bound::Included(s)) => s <= e,
        // Both exclusive at the same key would leave that key uncovered.
        (Bound::Excluded(e), Bound::Excluded(s)) => s < e,
    }
}

/// The set of base-table keys a read targets: explicit points, ranges, or
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Individual keys.
    pub points: Vec<Key>,
    /// Key ranges.
    pub ranges: Vec<KeyRange>,
    /// Whether the whole table is targeted.
    pub all: bool,
}

impl KeySet {
    /// The set of every key.
    pub fn all() -> Self {
        KeySet {
            all: true,
            ..KeySet::default()
        }
    }

    /// A set holding one point key.
    pub fn point(key: Key) -> Self {
        KeySet {
            points: vec![key],
            ..KeySet::default()
        }
    }

    /// A set holding the given point keys.
    pub fn points(keys: Vec<Key>) -> Self {
        KeySet {
            points: keys,
            ..KeySet::default()
        }
    }

    /// A set holding one range.
    pub fn range(range: KeyRange) -> Self {
        KeySet {
            ranges: vec![range],
            ..KeySet::default()
        }
    }

    /// Add a point key.
    pub fn add_point(&mut self, key: Key) {
        self.points.push(key);
    }

    /// Add a range.
    pub fn add_range(&mut self, range: KeyRange) {
        self.ranges.push(range);
    }

    /// Reduce the set to a minimal, ordered, non-overlapping list of ranges.
    ///
    /// Points become single-key ranges, empty ranges are dropped, and
    /// overlapping or touching ranges are merged, so reading the result in
    /// order visits every targeted key exactly once, in key order.
    pub fn canonicalize(&self) -> Vec<KeyRange> {
        if self.all {
            return vec![KeyRange::all()];
        }
        let mut ranges: Vec<KeyRange> = self
            .points
            .iter()
            .cloned()
            .map(KeyRange::point)
            .chain(self.ranges.iter().cloned())
            .filter(|r| !r.is_empty())
            .collect();
        ranges.sort_by(|a, b| cmp_start(&a.start, &b.start).then(cmp_end(&a.end, &b.end)));

        let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if joinable(&last.end, &range.start) => {
                    if cmp_end(&range.end, &last.end) == Ordering::Greater {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }
        merged
    }
}
