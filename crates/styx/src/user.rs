//! User and group identity.
//!
//! Identities are capability tokens supplied by the transport: the server
//! resolves the uname in a `Tattach` through a [`UserDb`] and attaches the
//! result to the fid. No authentication transaction happens here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::fcall::{NONUNAME, NOUID};

/// A user known to the server.
pub trait User: Send + Sync {
    fn name(&self) -> &str;
    fn id(&self) -> u32;
    fn groups(&self) -> Vec<Arc<dyn Group>>;
}

/// A group known to the server.
pub trait Group: Send + Sync {
    fn name(&self) -> &str;
    fn id(&self) -> u32;
}

/// Maps the uname/numeric-uname of an attach to an identity.
pub trait UserDb: Send + Sync {
    fn user(&self, uname: &str, n_uname: u32) -> Option<Arc<dyn User>>;
}

/// A group with a fixed name and id.
#[derive(Clone, Debug)]
pub struct StaticGroup {
    name: String,
    id: u32,
}

impl StaticGroup {
    pub fn new(name: &str, id: u32) -> StaticGroup {
        StaticGroup {
            name: name.to_owned(),
            id,
        }
    }
}

impl Group for StaticGroup {
    fn name(&self) -> &str {
        &self.name
    }
    fn id(&self) -> u32 {
        self.id
    }
}

/// An identity with a fixed name, id and group list.
pub struct StaticUser {
    name: String,
    id: u32,
    groups: Vec<Arc<dyn Group>>,
}

impl StaticUser {
    pub fn new(name: &str, id: u32, groups: &[(&str, u32)]) -> StaticUser {
        StaticUser {
            name: name.to_owned(),
            id,
            groups: groups
                .iter()
                .map(|&(name, id)| {
                    Arc::new(StaticGroup {
                        name: name.to_owned(),
                        id,
                    }) as Arc<dyn Group>
                })
                .collect(),
        }
    }
}

impl User for StaticUser {
    fn name(&self) -> &str {
        &self.name
    }
    fn id(&self) -> u32 {
        self.id
    }
    fn groups(&self) -> Vec<Arc<dyn Group>> {
        self.groups.clone()
    }
}

/// A fixed table of users.
#[derive(Default)]
pub struct StaticUsers {
    users: HashMap<String, Arc<StaticUser>>,
}

impl StaticUsers {
    pub fn new() -> StaticUsers {
        StaticUsers::default()
    }

    /// Register a user with its groups.
    pub fn add(&mut self, name: &str, id: u32, groups: &[(&str, u32)]) {
        self.users
            .insert(name.to_owned(), Arc::new(StaticUser::new(name, id, groups)));
    }
}

impl UserDb for StaticUsers {
    fn user(&self, uname: &str, _n_uname: u32) -> Option<Arc<dyn User>> {
        self.users.get(uname).cloned().map(|u| u as Arc<dyn User>)
    }
}

/// Accepts any uname, fabricating an identity whose only group carries the
/// same name. Suits synthetic servers that have no user database.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenUsers;

impl UserDb for OpenUsers {
    fn user(&self, uname: &str, n_uname: u32) -> Option<Arc<dyn User>> {
        let id = if n_uname == NONUNAME { NOUID } else { n_uname };
        Some(Arc::new(StaticUser::new(uname, id, &[(uname, id)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        let mut db = StaticUsers::new();
        db.add("alice", 1001, &[("staff", 20)]);

        let alice = db.user("alice", NONUNAME).unwrap();
        assert_eq!(alice.name(), "alice");
        assert_eq!(alice.id(), 1001);
        assert_eq!(alice.groups()[0].name(), "staff");

        assert!(db.user("mallory", NONUNAME).is_none());
    }

    #[test]
    fn open_users_accept_anyone() {
        let bob = OpenUsers.user("bob", NONUNAME).unwrap();
        assert_eq!(bob.name(), "bob");
        assert_eq!(bob.id(), NOUID);
        assert_eq!(bob.groups().len(), 1);

        let carol = OpenUsers.user("carol", 1003).unwrap();
        assert_eq!(carol.id(), 1003);
    }
}
