//! Scoped array lifetimes.
//!
//! Arrays produced by ops are registered with the innermost open scope.
//! When a scope ends, every array it tracks is disposed except the ones
//! marked with [`ScopeGuard::keep`], which move to the enclosing scope (or
//! become caller-owned at the outermost level). Reshaped views share data
//! with their source and are not tracked separately.
//!
//! Scopes end in strict stack order. A [`ScopeGuard`] ends its scope when
//! dropped, so arrays are released on early returns and panics too.

use super::Math;
use crate::error::{Error, Result};
use crate::ndarray::{DataHandle, NDArray};
use std::collections::HashSet;
use std::rc::Rc;

struct Frame {
    generation: u64,
    tracked: Vec<Rc<DataHandle>>,
    kept: HashSet<usize>,
}

impl Frame {
    fn owns(&self, data_id: usize) -> bool {
        self.tracked.iter().any(|h| h.id() == data_id)
    }
}

/// The stack of open scopes of one context.
#[derive(Default)]
pub(super) struct ScopeStack {
    frames: Vec<Frame>,
    generations: u64,
}

impl ScopeStack {
    pub(super) fn depth(&self) -> usize {
        self.frames.len()
    }

    fn push(&mut self) -> (usize, u64) {
        self.generations += 1;
        self.frames.push(Frame {
            generation: self.generations,
            tracked: Vec::new(),
            kept: HashSet::new(),
        });
        (self.frames.len(), self.generations)
    }

    /// Whether the frame opened at `depth` with `generation` is still on the stack.
    fn is_open(&self, depth: usize, generation: u64) -> bool {
        depth
            .checked_sub(1)
            .and_then(|i| self.frames.get(i))
            .is_some_and(|f| f.generation == generation)
    }

    /// Registers a freshly allocated handle with the innermost scope.
    pub(super) fn track_new(&mut self, handle: &Rc<DataHandle>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.tracked.push(Rc::clone(handle));
        }
    }

    /// Forgets `data_id` wherever it is tracked.
    pub(super) fn untrack(&mut self, data_id: usize) {
        for frame in &mut self.frames {
            frame.tracked.retain(|h| h.id() != data_id);
            frame.kept.remove(&data_id);
        }
    }

    fn check_innermost(&self, depth: usize, generation: u64) -> Result<()> {
        if !self.is_open(depth, generation) {
            return Err(Error::ScopeClosed { depth });
        }
        if depth == self.frames.len() {
            Ok(())
        } else {
            Err(Error::ScopeOrder {
                innermost: self.frames.len(),
                depth,
            })
        }
    }

    fn track(&mut self, depth: usize, generation: u64, handle: &Rc<DataHandle>) -> Result<()> {
        self.check_innermost(depth, generation)?;
        if handle.is_disposed() {
            return Err(Error::UseAfterDispose { id: handle.id() });
        }
        self.untrack(handle.id());
        if let Some(frame) = self.frames.last_mut() {
            frame.tracked.push(Rc::clone(handle));
        }
        Ok(())
    }

    fn keep(&mut self, depth: usize, generation: u64, handle: &Rc<DataHandle>) -> Result<()> {
        self.check_innermost(depth, generation)?;
        if handle.is_disposed() {
            return Err(Error::UseAfterDispose { id: handle.id() });
        }
        if let Some(frame) = self.frames.last_mut() {
            if frame.owns(handle.id()) {
                frame.kept.insert(handle.id());
            }
        }
        Ok(())
    }

    /// Pops the innermost frame, disposing what it owns and handing kept
    /// arrays to the parent.
    ///
    /// Disposal continues past failures; the first one is reported.
    fn pop(&mut self) -> Result<()> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let mut first_error = None;
        let mut released = 0;
        for handle in frame.tracked {
            if frame.kept.contains(&handle.id()) {
                if let Some(parent) = self.frames.last_mut() {
                    if !parent.owns(handle.id()) {
                        parent.tracked.push(handle);
                    }
                }
            } else if let Err(e) = handle.dispose() {
                first_error.get_or_insert(e);
            } else {
                released += 1;
            }
        }
        log::trace!("scope depth {} closed, {released} arrays released", self.frames.len() + 1);
        first_error.map_or(Ok(()), Err)
    }
}

/// An open scope. Ends when [`end`](Self::end) is called or when dropped.
#[must_use = "dropping the guard ends the scope immediately"]
pub struct ScopeGuard<'m> {
    math: &'m Math,
    depth: usize,
    generation: u64,
    open: bool,
}

impl ScopeGuard<'_> {
    /// Nesting depth of this scope, starting at 1.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Moves ownership of `x` to this scope.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeOrder`] unless this is the innermost scope,
    /// [`Error::UseAfterDispose`] for a disposed array.
    pub fn track(&self, x: &NDArray) -> Result<()> {
        self.math.scopes.borrow_mut().track(self.depth, self.generation, x.handle())
    }

    /// Exempts `x` from disposal when this scope ends.
    ///
    /// # Errors
    ///
    /// Same as [`track`](Self::track).
    pub fn keep(&self, x: &NDArray) -> Result<()> {
        self.math.scopes.borrow_mut().keep(self.depth, self.generation, x.handle())
    }

    /// Ends the scope.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeOrder`] if a nested scope is still open (it is closed
    /// too), [`Error::ScopeClosed`] if an enclosing scope already ended this
    /// one, or the first disposal failure.
    pub fn end(mut self) -> Result<()> {
        self.open = false;
        let mut scopes = self.math.scopes.borrow_mut();
        let order = scopes.check_innermost(self.depth, self.generation);
        if matches!(order, Err(Error::ScopeClosed { .. })) {
            return order;
        }
        let mut first_error = None;
        while scopes.depth() >= self.depth {
            if let Err(e) = scopes.pop() {
                first_error.get_or_insert(e);
            }
        }
        order?;
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let mut scopes = self.math.scopes.borrow_mut();
        if !scopes.is_open(self.depth, self.generation) {
            return;
        }
        while scopes.depth() >= self.depth {
            if let Err(e) = scopes.pop() {
                log::error!("error while closing scope: {e}");
            }
        }
    }
}

/// Values whose arrays should survive the scope that produced them.
pub trait Keep {
    /// Marks every array in `self` as kept by `scope`.
    ///
    /// # Errors
    ///
    /// Same as [`ScopeGuard::keep`].
    fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()>;
}

impl Keep for NDArray {
    fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()> {
        scope.keep(self)
    }
}

impl<T: Keep> Keep for Vec<T> {
    fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()> {
        self.iter().try_for_each(|item| item.keep(scope))
    }
}

impl<T: Keep> Keep for Option<T> {
    fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()> {
        self.as_ref().map_or(Ok(()), |item| item.keep(scope))
    }
}

macro_rules! keep_nothing {
    ($($t:ty),*) => {
        $(impl Keep for $t {
            fn keep(&self, _: &ScopeGuard<'_>) -> Result<()> {
                Ok(())
            }
        })*
    };
}

keep_nothing!((), bool, f32, f64, usize, u64, i64);

macro_rules! keep_tuple {
    ($($name:ident),+) => {
        impl<$($name: Keep),+> Keep for ($($name,)+) {
            #[allow(non_snake_case)]
            fn keep(&self, scope: &ScopeGuard<'_>) -> Result<()> {
                let ($($name,)+) = self;
                $($name.keep(scope)?;)+
                Ok(())
            }
        }
    };
}

keep_tuple!(A, B);
keep_tuple!(A, B, C);
keep_tuple!(A, B, C, D);

impl Math {
    /// Opens a nested scope.
    pub fn begin_scope(&self) -> ScopeGuard<'_> {
        let (depth, generation) = self.scopes.borrow_mut().push();
        ScopeGuard {
            math: self,
            depth,
            generation,
            open: true,
        }
    }

    /// Runs `f` in a fresh scope. Arrays in the returned value are kept;
    /// everything else allocated inside is disposed, also when `f` fails
    /// or panics.
    ///
    /// # Errors
    ///
    /// The error of `f`, or a failure while closing the scope.
    pub fn scope<T, F>(&self, f: F) -> Result<T>
    where
        T: Keep,
        F: FnOnce(&ScopeGuard<'_>) -> Result<T>,
    {
        let guard = self.begin_scope();
        match f(&guard) {
            Ok(value) => {
                value.keep(&guard)?;
                guard.end()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(cleanup) = guard.end() {
                    log::warn!("scope cleanup after `{e}` also failed: {cleanup}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_arrays_move_to_parent() {
        let math = Math::cpu();
        let outer = math.begin_scope();
        let inner = math.begin_scope();
        let a = math.fill(vec![2], 1.0);
        let b = math.fill(vec![2], 2.0);
        inner.keep(&a).unwrap();
        inner.end().unwrap();
        assert!(!a.is_disposed());
        assert!(b.is_disposed());
        outer.end().unwrap();
        assert!(a.is_disposed());
        assert_eq!(math.live_arrays(), 0);
    }

    #[test]
    fn ending_outer_first_is_an_order_error() {
        let math = Math::cpu();
        let outer = math.begin_scope();
        let inner = math.begin_scope();
        let x = math.scalar(1.0);
        assert!(matches!(outer.end(), Err(Error::ScopeOrder { innermost: 2, depth: 1 })));
        assert!(x.is_disposed());
        assert_eq!(math.scope_depth(), 0);
        drop(inner);
    }

    #[test]
    fn track_from_outer_scope_is_rejected() {
        let math = Math::cpu();
        let outer = math.begin_scope();
        let _inner = math.begin_scope();
        let x = NDArray::scalar(1.0);
        assert!(matches!(outer.track(&x), Err(Error::ScopeOrder { .. })));
    }
}
