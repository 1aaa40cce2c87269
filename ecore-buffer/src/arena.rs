//! Generational slot arena
//!
//! Buffers and framebuffers are addressed by index + generation so a handle
//! to a freed slot can never reach the object that reuses it.

/// Position in an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index {
    slot: u32,
    generation: u32,
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            let (generation, next_free) = match entry {
                Entry::Vacant { generation, next_free } => (*generation + 1, *next_free),
                Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            self.free_head = next_free;
            return Index { slot, generation };
        }

        let slot = self.entries.len() as u32;
        self.entries.push(Entry::Occupied { generation: 0, value });
        Index { slot, generation: 0 }
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        match self.entries.get(index.slot as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == index.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == index.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, index: Index) -> bool {
        self.get(index).is_some()
    }

    pub fn remove(&mut self, index: Index) -> Option<T> {
        if !self.contains(index) {
            return None;
        }
        let vacant = Entry::Vacant {
            generation: index.generation,
            next_free: self.free_head,
        };
        let old = std::mem::replace(&mut self.entries[index.slot as usize], vacant);
        self.free_head = Some(index.slot);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indices of every live entry, in slot order
    pub fn indices(&self) -> Vec<Index> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Occupied { generation, .. } => Some(Index {
                    slot: slot as u32,
                    generation: *generation,
                }),
                Entry::Vacant { .. } => None,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| match entry {
            Entry::Occupied { generation, value } => Some((
                Index {
                    slot: slot as u32,
                    generation: *generation,
                },
                value,
            )),
            Entry::Vacant { .. } => None,
        })
    }
}
