//! Ownership of packed units and their origin (fallback) chain.

use crate::{LayoutError, PackedUnit};

/// Index of a unit inside a [`UnitArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UnitHandle(u32);

impl UnitHandle {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owns every packed unit of a program.
///
/// An optimized unit records its less-optimized predecessor as an origin
/// handle. Origins always point at units inserted earlier, so walking the
/// chain terminates.
#[derive(Debug, Default)]
pub struct UnitArena {
    units: Vec<PackedUnit>,
}

impl UnitArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `unit`.
    ///
    /// Fails if the unit's origin does not name a unit already here.
    pub fn insert(&mut self, unit: PackedUnit) -> Result<UnitHandle, LayoutError> {
        if let Some(origin) = unit.origin() {
            if origin as usize >= self.units.len() {
                return Err(LayoutError::DanglingOrigin(origin));
            }
        }
        let raw = u32::try_from(self.units.len()).map_err(|_| LayoutError::TooLarge {
            what: "unit arena",
        })?;
        self.units.push(unit);
        Ok(UnitHandle::new(raw))
    }

    pub fn get(&self, handle: UnitHandle) -> Option<&PackedUnit> {
        self.units.get(handle.index())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The version `handle` falls back to when a speculation fails.
    pub fn origin(&self, handle: UnitHandle) -> Option<UnitHandle> {
        self.get(handle)?.origin().map(UnitHandle::new)
    }

    /// Walk from `handle` through successive origins, `handle` first.
    pub fn origin_chain(&self, handle: UnitHandle) -> impl Iterator<Item = UnitHandle> + '_ {
        let start = self.get(handle).map(|_| handle);
        std::iter::successors(start, move |&h| self.origin(h))
    }

    /// Index within `handle`'s unit of the Code object starting at byte
    /// `offset`.
    pub fn index_of_code(&self, handle: UnitHandle, offset: usize) -> Option<usize> {
        let code = self.get(handle)?.code_at(offset).ok()?;
        Some(code.index())
    }

    /// The least optimized version in `handle`'s chain.
    pub fn baseline(&self, handle: UnitHandle) -> Option<UnitHandle> {
        self.origin_chain(handle).last()
    }
}
