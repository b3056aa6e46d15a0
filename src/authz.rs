//! Pure, stateless, deterministic permission resolution.
//!
//! Takes rows already read from the [`crate::storage::Store`] and
//! yields a verdict — no I/O of its own, so it is unit-testable
//! without a database.

use std::collections::HashSet;

use crate::storage::models::{Page, PagePermission, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict {
    pub view: bool,
    pub edit: bool,
    pub share: bool,
}

/// Resolve `user_id`'s effective permission on `page`, given the page's
/// permission rows and the set of group ids `user_id` belongs to.
pub fn resolve(
    user_id: &str,
    page: &Page,
    permissions: &[PagePermission],
    user_groups: &HashSet<String>,
) -> Verdict {
    if page.owner_id == user_id {
        return Verdict { view: true, edit: true, share: true };
    }

    let mut view = false;
    let mut edit = false;

    for perm in permissions {
        if perm.page_id != page.id {
            continue;
        }
        let matches = match &perm.subject {
            Subject::User(uid) => uid == user_id,
            Subject::Group(gid) => user_groups.contains(gid),
        };
        if !matches {
            continue;
        }
        view |= perm.can_view;
        edit |= perm.can_edit;
    }

    // Edit implies view at resolve time, even if the stored row has
    // `can_edit=true, can_view=false` (legal but unusual in storage).
    if edit {
        view = true;
    }

    Verdict { view, edit, share: false }
}
