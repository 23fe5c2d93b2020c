/// Maximum number of simultaneously-bound roles (spec §4.6).
pub const MAX_ROLES: usize = 10;

/// An indexed array of role bindings: each role is an owned copy of a tuple
/// buffer (spec §4.6: "a pointer to a tuple buffer"). This crate binds an
/// owned `Vec<u8>` rather than a borrowed pointer, since tuple content is
/// read out of a `Rc<RefCell<MemoryManager>>`-backed store and can't outlive
/// the borrow that produced it — see `storage::StorageAlloc`'s doc comment.
#[derive(Default, Clone)]
pub struct EvalContext {
    roles: [Option<Vec<u8>>; MAX_ROLES],
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, role: usize, tuple: Vec<u8>) {
        self.roles[role] = Some(tuple);
    }

    pub fn unbind(&mut self, role: usize) {
        self.roles[role] = None;
    }

    pub fn is_bound(&self, role: usize) -> bool {
        self.roles[role].is_some()
    }

    pub fn role(&self, role: usize) -> &[u8] {
        self.roles[role]
            .as_deref()
            .unwrap_or_else(|| panic!("eval context role {role} is not bound"))
    }

    pub fn role_mut(&mut self, role: usize) -> &mut Vec<u8> {
        self.roles[role]
            .as_mut()
            .unwrap_or_else(|| panic!("eval context role {role} is not bound"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_read_roundtrips() {
        let mut ctx = EvalContext::new();
        ctx.bind(0, vec![1, 2, 3]);
        assert_eq!(ctx.role(0), &[1, 2, 3]);
        ctx.unbind(0);
        assert!(!ctx.is_bound(0));
    }
}
