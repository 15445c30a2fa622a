use crate::kobject::Kobject;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;

/// Objects whose last capability went away during a map or unmap call.
///
/// Destruction may allocate and take locks of its own, so it never runs
/// under a frame lock. The syscall layer calls [`reap`](Self::reap) once
/// all locks of the call are released.
#[derive(Debug, Default)]
pub struct ReapList {
    objects: Vec<Arc<Kobject>>,
}

impl ReapList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, obj: Arc<Kobject>) {
        self.objects.push(obj);
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Kobject>> {
        self.objects.iter()
    }

    /// Destroys the queued objects. Returns how many there were.
    pub fn reap(&mut self) -> usize {
        let n = self.objects.len();
        for obj in self.objects.drain(..) {
            debug!("reap: destroying kobject {}", obj.id());
            obj.destroy();
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobject::{KobjectKind, Lifecycle};

    #[test]
    fn reap_destroys_queued_objects() {
        let obj = Kobject::new(3, KobjectKind::Factory);
        assert!(obj.initiate_deletion());

        let mut reap = ReapList::new();
        reap.push(obj.clone());
        assert_eq!(reap.len(), 1);
        assert_eq!(reap.reap(), 1);
        assert!(reap.is_empty());
        assert_eq!(obj.state(), Lifecycle::Destroyed);
    }
}
