//! Object table indexed by the host-assigned object id.

use core::fmt;

/// Object id assigned by the host.
pub type Oid = u8;

/// Errors raised by [`ObjectDirectory`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectError {
    /// The id is beyond the table capacity.
    InvalidOid(Oid),
    /// The id is already bound to an object.
    AlreadyAllocated(Oid),
    /// Nothing is bound to the id.
    NotFound(Oid),
    /// The id is bound to an object of another kind.
    WrongKind(Oid),
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectError::InvalidOid(oid) => write!(f, "oid {oid} out of range"),
            ObjectError::AlreadyAllocated(oid) => write!(f, "oid {oid} already allocated"),
            ObjectError::NotFound(oid) => write!(f, "oid {oid} not configured"),
            ObjectError::WrongKind(oid) => write!(f, "oid {oid} has the wrong object type"),
        }
    }
}

/// Fixed-capacity table of objects, one slot per id.
#[derive(Debug)]
pub struct ObjectDirectory<T, const N: usize> {
    slots: [Option<T>; N],
}

impl<T, const N: usize> ObjectDirectory<T, N> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
        }
    }

    /// Binds `value` to `oid`.
    pub fn alloc(&mut self, oid: Oid, value: T) -> Result<&mut T, ObjectError> {
        let slot = self
            .slots
            .get_mut(usize::from(oid))
            .ok_or(ObjectError::InvalidOid(oid))?;
        if slot.is_some() {
            return Err(ObjectError::AlreadyAllocated(oid));
        }
        Ok(slot.insert(value))
    }

    /// Object bound to `oid`.
    pub fn get(&self, oid: Oid) -> Result<&T, ObjectError> {
        self.slots
            .get(usize::from(oid))
            .ok_or(ObjectError::InvalidOid(oid))?
            .as_ref()
            .ok_or(ObjectError::NotFound(oid))
    }

    /// Mutable access to the object bound to `oid`.
    pub fn get_mut(&mut self, oid: Oid) -> Result<&mut T, ObjectError> {
        self.slots
            .get_mut(usize::from(oid))
            .ok_or(ObjectError::InvalidOid(oid))?
            .as_mut()
            .ok_or(ObjectError::NotFound(oid))
    }

    /// Iterates over bound objects in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Oid, &mut T)> {
        self.slots
            .iter_mut()
            .zip(0..=Oid::MAX)
            .filter_map(|(slot, oid)| slot.as_mut().map(|value| (oid, value)))
    }

    /// Ids with a bound object.
    pub fn oids(&self) -> impl Iterator<Item = Oid> + '_ {
        self.slots
            .iter()
            .zip(0..=Oid::MAX)
            .filter_map(|(slot, oid)| slot.as_ref().map(|_| oid))
    }

    /// Number of bound objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns `true` when nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for ObjectDirectory<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
