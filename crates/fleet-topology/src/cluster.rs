//! Identified, ordered groups of elements.

use std::hash::{Hash, Hasher};

use fleet_types::{FleetError, FleetResult};

/// An ordered group of elements that are close to each other.
///
/// Two clusters are equal when their ids are equal; the elements do not
/// take part in identity.
#[derive(Debug, Clone)]
pub struct Cluster<E> {
    id: String,
    elements: Vec<E>,
}

impl<E> Cluster<E> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: Vec::new(),
        }
    }

    pub fn with_elements(id: impl Into<String>, elements: Vec<E>) -> Self {
        Self {
            id: id.into(),
            elements,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn elements(&self) -> &[E] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Append elements at the end, keeping their order.
    pub fn add(&mut self, elements: impl IntoIterator<Item = E>) {
        self.elements.extend(elements);
    }

    /// Remove and return the last `n` elements, in their original order.
    ///
    /// Fails with `BoundaryViolation` when `n` exceeds the current size.
    /// The cluster is left untouched in that case.
    pub fn remove_last(&mut self, n: usize) -> FleetResult<Vec<E>> {
        let len = self.elements.len();
        if n > len {
            return Err(FleetError::BoundaryViolation(format!(
                "cannot remove last {n} elements from cluster {} of size {len}",
                self.id
            )));
        }
        Ok(self.elements.split_off(len - n))
    }
}

impl<E: PartialEq> Cluster<E> {
    /// Remove every occurrence of the given elements. Returns how many
    /// elements were removed.
    pub fn remove(&mut self, elements: &[E]) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| !elements.contains(e));
        before - self.elements.len()
    }

    pub fn contains(&self, element: &E) -> bool {
        self.elements.contains(element)
    }
}

impl<E> PartialEq for Cluster<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Cluster<E> {}

impl<E> Hash for Cluster<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_last_succeeds_up_to_size() {
        for k in 0..6usize {
            for n in 0..=k {
                let mut cluster = Cluster::with_elements("c", (0..k).collect::<Vec<_>>());
                let removed = cluster.remove_last(n).unwrap();
                assert_eq!(removed, ((k - n)..k).collect::<Vec<_>>());
                assert_eq!(cluster.len(), k - n);
            }
        }
    }

    #[test]
    fn remove_last_fails_past_size() {
        for k in 0..6usize {
            for n in (k + 1)..(k + 4) {
                let mut cluster = Cluster::with_elements("c", (0..k).collect::<Vec<_>>());
                let err = cluster.remove_last(n).unwrap_err();
                assert!(matches!(err, FleetError::BoundaryViolation(_)));
                // Not clamped: nothing was removed.
                assert_eq!(cluster.len(), k);
            }
        }
    }

    #[test]
    fn add_and_remove_elements() {
        let mut cluster = Cluster::new("c0");
        cluster.add(["a", "b", "c", "b"]);
        assert_eq!(cluster.len(), 4);

        assert_eq!(cluster.remove(&["b"]), 2);
        assert_eq!(cluster.elements(), &["a", "c"]);
        assert!(!cluster.contains(&"b"));
        assert_eq!(cluster.remove(&["zzz"]), 0);
    }

    #[test]
    fn identity_is_the_id() {
        let a = Cluster::with_elements("c1", vec![1, 2]);
        let b = Cluster::with_elements("c1", vec![3]);
        let c = Cluster::with_elements("c2", vec![1, 2]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
