//! Controller side objects that mirror debugee entities (modules, threads, values...).
//!
//! Objects form an ownership tree stored in an arena. An object handed out to the user is
//! counted by external references; once nobody refers to it the object is neutered by the
//! next sweep, children before parents. Objects backed by a debugee handle have the handle
//! released at the next real resume. Slots of neutered objects are reused, a generation
//! number keeps ids of neutered objects from resolving to their successors.

use crate::debugger::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    slot: u32,
    generation: u32,
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    external_refs: u32,
    remote_handle: Option<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    /// `None` marks a free slot.
    node: Option<Node>,
}

#[derive(Debug, Default)]
pub struct ObjectTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending_release: Vec<u64>,
}

impl ObjectTree {
    fn node(&self, id: ObjectId) -> Result<&Node, Error> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
            .ok_or(Error::ObjectNeutered(id.slot))
    }

    fn node_mut(&mut self, id: ObjectId) -> Result<&mut Node, Error> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
            .ok_or(Error::ObjectNeutered(id.slot))
    }

    fn live(&self) -> impl Iterator<Item = (ObjectId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            let id = ObjectId {
                slot: i as u32,
                generation: s.generation,
            };
            s.node.as_ref().map(|n| (id, n))
        })
    }

    /// Register a new object with a single external reference.
    pub fn insert(
        &mut self,
        parent: Option<ObjectId>,
        remote_handle: Option<u64>,
    ) -> Result<ObjectId, Error> {
        if let Some(parent) = parent {
            self.node(parent)?;
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len())
                    .map_err(|_| Error::ResourceExhausted("object ids"))?;
                self.slots.push(Slot::default());
                slot
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.node = Some(Node {
            parent,
            children: vec![],
            external_refs: 1,
            remote_handle,
        });
        let id = ObjectId {
            slot,
            generation: entry.generation,
        };

        if let Some(parent) = parent {
            self.node_mut(parent)?.children.push(id);
        }
        Ok(id)
    }

    pub fn add_ref(&mut self, id: ObjectId) -> Result<(), Error> {
        self.node_mut(id)?.external_refs += 1;
        Ok(())
    }

    /// Drop an external reference, return the number of remaining ones.
    pub fn release(&mut self, id: ObjectId) -> Result<u32, Error> {
        let node = self.node_mut(id)?;
        node.external_refs = node.external_refs.saturating_sub(1);
        let refs = node.external_refs;
        if refs == 0 {
            if let Some(handle) = node.remote_handle.take() {
                self.pending_release.push(handle);
            }
        }
        Ok(refs)
    }

    /// Debugee handles whose objects are no longer referenced.
    pub fn take_pending_release(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_release)
    }

    pub fn is_neutered(&self, id: ObjectId) -> bool {
        self.node(id).is_err()
    }

    pub fn external_refs(&self, id: ObjectId) -> Result<u32, Error> {
        Ok(self.node(id)?.external_refs)
    }

    pub fn parent(&self, id: ObjectId) -> Result<Option<ObjectId>, Error> {
        Ok(self.node(id)?.parent)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live objects in post-order, children before their parents.
    fn post_order(&self) -> Vec<ObjectId> {
        let mut order = Vec::with_capacity(self.slots.len());
        let roots: Vec<_> = self
            .live()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| id)
            .collect();

        for root in roots {
            let mut stack = vec![(root, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                stack.push((id, true));
                if let Ok(node) = self.node(id) {
                    stack.extend(node.children.iter().rev().map(|c| (*c, false)));
                }
            }
        }
        order
    }

    fn neuter(&mut self, id: ObjectId) {
        let Some(slot) = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation && s.node.is_some())
        else {
            return;
        };
        let node = slot.node.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);

        let Some(node) = node else {
            return;
        };
        if let Some(parent) = node.parent.and_then(|p| self.node_mut(p).ok()) {
            parent.children.retain(|c| *c != id);
        }
    }

    /// Neuter every object without external references and without live children.
    /// Return the number of neutered objects.
    pub fn neuter_unreferenced(&mut self) -> usize {
        let mut count = 0;
        for id in self.post_order() {
            let Ok(node) = self.node(id) else {
                continue;
            };
            if node.external_refs == 0 && node.children.is_empty() {
                self.neuter(id);
                count += 1;
            }
        }
        if count > 0 {
            log::debug!(target: "dispatch", "neutered {count} objects");
        }
        count
    }

    /// Tear the whole tree down, children first. Debugee handles are forgotten.
    pub fn neuter_all(&mut self) -> usize {
        let order = self.post_order();
        let count = order.len();
        for id in order {
            self.neuter(id);
        }
        self.pending_release.clear();
        count
    }
}
