//! Jeux de registres : slots indexés, nullables, à taille fixe.
//!
//! Chaque slot occupé porte une cellule partagée (`Rc<RefCell<Value>>`) :
//! c'est ce qui permet `ref`, `paref` et les variables capturées par les
//! closures sans pointeurs bruts. Un slot marqué [`SlotFlags::REFERENCE`]
//! écrit à travers sa cellule au lieu de la remplacer.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::value::Value;
use crate::{Error, RResult};

/// Cellule partagée entre slots aliasés.
pub type Cell = Rc<RefCell<Value>>;

bitflags! {
    /// Marques par slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u8 {
        /// Le slot aliase une cellule possédée ailleurs.
        const REFERENCE = 0b0000_0001;
        /// Le slot sera capturé par la prochaine closure.
        const BIND      = 0b0000_0010;
    }
}

/// Jeu de registres à taille fixe.
#[derive(Debug, Default)]
pub struct RegisterSet {
    slots: Vec<Option<Cell>>,
    flags: Vec<SlotFlags>,
}

impl RegisterSet {
    /// `size` slots vides.
    pub fn new(size: usize) -> Self { Self { slots: vec![None; size], flags: vec![SlotFlags::empty(); size] } }

    /// Nombre de slots.
    pub fn size(&self) -> usize { self.slots.len() }

    fn check(&self, index: u32) -> RResult<usize> {
        let i = index as usize;
        if i < self.slots.len() { Ok(i) } else { Err(Error::OutOfBounds(index)) }
    }

    /// Copie de la valeur ; un slot vide est une erreur.
    pub fn get(&self, index: u32) -> RResult<Value> { Ok(self.cell(index)?.borrow().clone()) }

    /// Cellule du slot ; un slot vide est une erreur.
    pub fn cell(&self, index: u32) -> RResult<Cell> {
        let i = self.check(index)?;
        self.slots[i].clone().ok_or(Error::NullRegister(index))
    }

    /// Écrit `value` ; un slot REFERENCE écrit à travers sa cellule.
    pub fn set(&mut self, index: u32, value: Value) -> RResult<()> {
        let i = self.check(index)?;
        if self.flags[i].contains(SlotFlags::REFERENCE) {
            if let Some(cell) = &self.slots[i] {
                *cell.borrow_mut() = value;
                return Ok(());
            }
        }
        self.slots[i] = Some(Rc::new(RefCell::new(value)));
        self.flags[i].remove(SlotFlags::REFERENCE);
        Ok(())
    }

    /// Fait pointer le slot sur `cell` (alias).
    pub fn alias(&mut self, index: u32, cell: Cell) -> RResult<()> {
        let i = self.check(index)?;
        self.slots[i] = Some(cell);
        self.flags[i].insert(SlotFlags::REFERENCE);
        Ok(())
    }

    /// Retire la valeur et laisse le slot vide.
    pub fn take(&mut self, index: u32) -> RResult<Value> {
        let i = self.check(index)?;
        let cell = self.slots[i].take().ok_or(Error::NullRegister(index))?;
        self.flags[i] = SlotFlags::empty();
        Ok(Rc::try_unwrap(cell).map_or_else(|shared| shared.borrow().clone(), RefCell::into_inner))
    }

    /// Modifie la valeur en place.
    pub fn update<T>(&self, index: u32, f: impl FnOnce(&mut Value) -> RResult<T>) -> RResult<T> {
        let cell = self.cell(index)?;
        let mut value = cell.borrow_mut();
        f(&mut value)
    }

    /// Échange deux slots (contenu et marques).
    pub fn swap(&mut self, a: u32, b: u32) -> RResult<()> {
        let (i, j) = (self.check(a)?, self.check(b)?);
        self.slots.swap(i, j);
        self.flags.swap(i, j);
        Ok(())
    }

    /// Vide le slot ; sans effet s'il l'est déjà.
    pub fn free(&mut self, index: u32) -> RResult<()> {
        let i = self.check(index)?;
        self.slots[i] = None;
        self.flags[i] = SlotFlags::empty();
        Ok(())
    }

    /// Slot vide ?
    pub fn is_null(&self, index: u32) -> RResult<bool> { Ok(self.slots[self.check(index)?].is_none()) }

    /// Marques du slot.
    pub fn flags(&self, index: u32) -> RResult<SlotFlags> { Ok(self.flags[self.check(index)?]) }

    /// Ajoute des marques.
    pub fn mark(&mut self, index: u32, flags: SlotFlags) -> RResult<()> {
        let i = self.check(index)?;
        self.flags[i].insert(flags);
        Ok(())
    }

    /// Retire des marques sur tous les slots.
    pub fn unmark_all(&mut self, flags: SlotFlags) {
        for f in &mut self.flags {
            f.remove(flags);
        }
    }

    /// Index des slots portant toutes les marques `flags`.
    pub fn marked(&self, flags: SlotFlags) -> Vec<u32> {
        self.flags.iter().enumerate().filter(|(_, f)| f.contains(flags)).map(|(i, _)| i as u32).collect()
    }
}
