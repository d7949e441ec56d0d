//! Growable stack with offset-from-top access, used for both the value stack
//! and the call stack.

use std::ops::{Index, IndexMut};

#[derive(Clone, Debug)]
pub struct FastStack<T> {
    items: Vec<T>,
}

impl<T> Default for FastStack<T> {
    fn default() -> Self {
        FastStack { items: Vec::new() }
    }
}

impl<T> FastStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FastStack {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Element `offset` positions below the top (0 is the top).
    pub fn peek(&self, offset: usize) -> Option<&T> {
        let len = self.items.len();
        if offset < len {
            self.items.get(len - 1 - offset)
        } else {
            None
        }
    }

    pub fn peek_mut(&mut self, offset: usize) -> Option<&mut T> {
        let len = self.items.len();
        if offset < len {
            self.items.get_mut(len - 1 - offset)
        } else {
            None
        }
    }

    /// Element at absolute position `index` from the bottom.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn insert(&mut self, index: usize, item: T) {
        self.items.insert(index, item);
    }

    /// Drops the top `count` elements (fewer if the stack is shorter).
    pub fn remove_last(&mut self, count: usize) {
        let len = self.items.len();
        self.items.truncate(len.saturating_sub(count));
    }

    /// Shrinks the stack to `len` elements.
    pub fn crop(&mut self, len: usize) {
        self.items.truncate(len);
    }

    /// Removes and returns everything from absolute position `at` upward.
    pub fn split_off(&mut self, at: usize) -> Vec<T> {
        let at = at.min(self.items.len());
        self.items.split_off(at)
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Iterates from the top of the stack downward.
    pub fn iter_from_top(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }
}

impl<T> Index<usize> for FastStack<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<T> IndexMut<usize> for FastStack<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.items[index]
    }
}
