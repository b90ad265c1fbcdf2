//! In-memory directory used by tests and the load harness.
//!
//! Entries live in a `BTreeMap` behind a `parking_lot::RwLock`. Searches take
//! the read lock for their whole duration; writes take the write lock.
//!
//! Access rules are deliberately small: writes need an authenticated
//! identity, and anonymous callers cannot see entries inside restricted
//! subtrees. `userPassword` is never returned by search.

pub mod virtual_attrs;

use std::collections::BTreeMap;

use bytes::Bytes;
use ldapd_core::{
    AddRequest, AuthState, CompareRequest, ConditionResult, DeleteRequest, Dn, Entry,
    ExtendedRequest, Filter, LdapResult, ModificationType, ModifyRequest, Operation, Request,
    ResultCode, SearchRequest, SearchScope, AttributeMatcher,
};
use parking_lot::RwLock;

use crate::error::BackendError;
use crate::password::StoredPassword;
use crate::traits::{Backend, IdentityMapper, Privilege, UserRecord};

pub use virtual_attrs::{EntryTree, HasSubordinates, VirtualAttributeProvider, VirtualAttributes, VirtualEntry};

/// "Who am I?" extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

const PASSWORD_ATTRIBUTE: &str = "userpassword";
const PRIVILEGE_ATTRIBUTE: &str = "ds-privilege-name";
const LOGIN_ATTRIBUTE: &str = "uid";

#[derive(Debug)]
pub struct InMemoryDirectory {
    entries: RwLock<EntryTree>,
    restricted: Vec<Dn>,
    virtual_attributes: VirtualAttributes,
}

impl InMemoryDirectory {
    /// An empty directory with the built-in virtual attributes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            restricted: Vec::new(),
            virtual_attributes: VirtualAttributes::with_builtin(),
        }
    }

    /// Hides `base` and everything below it from anonymous callers.
    #[must_use]
    pub fn with_restricted_subtree(mut self, base: Dn) -> Self {
        self.restricted.push(base);
        self
    }

    #[must_use]
    pub fn with_virtual_attributes(mut self, registry: VirtualAttributes) -> Self {
        self.virtual_attributes = registry;
        self
    }

    /// Loads an entry without access or parent checks. Replaces any entry
    /// with the same DN.
    pub fn insert(&self, entry: Entry) {
        self.entries.write().insert(entry.dn.clone(), entry);
    }

    #[must_use]
    pub fn get(&self, dn: &Dn) -> Option<Entry> {
        self.entries.read().get(dn).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn visible_to(&self, dn: &Dn, auth: &AuthState) -> bool {
        auth.effective_identity().is_some() || !self.restricted.iter().any(|base| dn.is_within(base))
    }

    fn search(
        &self,
        operation: &Operation,
        request: &SearchRequest,
        auth: &AuthState,
    ) -> Result<LdapResult, BackendError> {
        let entries = self.entries.read();
        if !request.base.is_root()
            && (!entries.contains_key(&request.base) || !self.visible_to(&request.base, auth))
        {
            return Err(BackendError::NoSuchObject(request.base.to_string()));
        }

        let mut found = Vec::new();
        for (dn, entry) in entries.iter() {
            if operation.is_cancelled() {
                return Err(BackendError::Canceled);
            }
            let in_scope = match request.scope {
                SearchScope::Base => *dn == request.base,
                SearchScope::OneLevel => dn.is_child_of(&request.base),
                SearchScope::Subtree => dn.is_within(&request.base),
            };
            if !in_scope || !self.visible_to(dn, auth) {
                continue;
            }
            if !request
                .filter
                .evaluate(&self.virtual_attributes.matcher(entry, &entries))
                .is_true()
            {
                continue;
            }
            if request.size_limit > 0 && found.len() == request.size_limit {
                return Ok(LdapResult::new(operation.message_id(), ResultCode::SizeLimitExceeded)
                    .with_entries(found));
            }
            let mut returned = entry.project(&request.attributes);
            returned.remove_attribute(PASSWORD_ATTRIBUTE);
            self.virtual_attributes
                .materialize(&mut returned, entry, &entries, &request.attributes);
            found.push(returned);
        }
        Ok(LdapResult::success(operation.message_id()).with_entries(found))
    }

    fn add(&self, operation: &Operation, request: &AddRequest, auth: &AuthState) -> Result<LdapResult, BackendError> {
        require_authenticated(auth, "add")?;
        let dn = &request.entry.dn;
        let mut entries = self.entries.write();
        if entries.contains_key(dn) {
            return Err(BackendError::AlreadyExists(dn.to_string()));
        }
        if let Some(parent) = dn.parent().filter(|p| !p.is_root()) {
            if !entries.contains_key(&parent) {
                return Err(BackendError::NoSuchObject(parent.to_string()));
            }
        }
        entries.insert(dn.clone(), request.entry.clone());
        Ok(LdapResult::success(operation.message_id()))
    }

    fn delete(
        &self,
        operation: &Operation,
        request: &DeleteRequest,
        auth: &AuthState,
    ) -> Result<LdapResult, BackendError> {
        require_authenticated(auth, "delete")?;
        let mut entries = self.entries.write();
        if !entries.contains_key(&request.dn) {
            return Err(BackendError::NoSuchObject(request.dn.to_string()));
        }
        if entries.keys().any(|dn| dn.is_child_of(&request.dn)) {
            return Err(BackendError::NotAllowedOnNonLeaf(request.dn.to_string()));
        }
        entries.remove(&request.dn);
        Ok(LdapResult::success(operation.message_id()))
    }

    /// Applies every change to a copy and stores it only if all succeed.
    fn modify(
        &self,
        operation: &Operation,
        request: &ModifyRequest,
        auth: &AuthState,
    ) -> Result<LdapResult, BackendError> {
        require_authenticated(auth, "modify")?;
        let mut entries = self.entries.write();
        let Some(current) = entries.get(&request.dn) else {
            return Err(BackendError::NoSuchObject(request.dn.to_string()));
        };
        let mut updated = current.clone();
        for change in &request.changes {
            if self.virtual_attributes.get(&change.attribute).is_some() {
                return Err(BackendError::Unwilling(format!(
                    "{} is computed and cannot be modified",
                    change.attribute
                )));
            }
            match change.kind {
                ModificationType::Add => {
                    for value in &change.values {
                        updated.add_value(&change.attribute, value.clone());
                    }
                }
                ModificationType::Delete if change.values.is_empty() => {
                    if !updated.remove_attribute(&change.attribute) {
                        return Err(BackendError::NoSuchAttribute(change.attribute.clone()));
                    }
                }
                ModificationType::Delete => {
                    for value in &change.values {
                        if !updated.remove_value(&change.attribute, value) {
                            return Err(BackendError::NoSuchAttribute(format!(
                                "{}: {value}",
                                change.attribute
                            )));
                        }
                    }
                }
                ModificationType::Replace => updated.replace(&change.attribute, change.values.clone()),
            }
        }
        entries.insert(request.dn.clone(), updated);
        Ok(LdapResult::success(operation.message_id()))
    }

    fn compare(
        &self,
        operation: &Operation,
        request: &CompareRequest,
        auth: &AuthState,
    ) -> Result<LdapResult, BackendError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&request.dn)
            .filter(|_| self.visible_to(&request.dn, auth))
            .ok_or_else(|| BackendError::NoSuchObject(request.dn.to_string()))?;

        let matcher = self.virtual_attributes.matcher(entry, &entries);
        if matcher.present(&request.attribute) != ConditionResult::True {
            return Err(BackendError::NoSuchAttribute(request.attribute.clone()));
        }
        let code = match Filter::Equality(request.attribute.clone(), request.value.clone()).evaluate(&matcher) {
            ConditionResult::True => ResultCode::CompareTrue,
            ConditionResult::False => ResultCode::CompareFalse,
            ConditionResult::Undefined => {
                return Err(BackendError::NoSuchAttribute(format!(
                    "{} cannot be compared with {:?}",
                    request.attribute, request.value
                )))
            }
        };
        Ok(LdapResult::new(operation.message_id(), code))
    }

    fn extended(operation: &Operation, request: &ExtendedRequest, auth: &AuthState) -> Result<LdapResult, BackendError> {
        if request.oid != WHO_AM_I_OID {
            return Err(BackendError::Protocol(format!(
                "unsupported extended operation {}",
                request.oid
            )));
        }
        let authzid = auth
            .effective_identity()
            .map(|dn| format!("dn:{dn}"))
            .unwrap_or_default();
        Ok(LdapResult::success(operation.message_id())
            .with_response(None, Some(Bytes::from(authzid))))
    }

    fn user_record(entry: &Entry) -> UserRecord {
        let username = entry
            .first_value(LOGIN_ATTRIBUTE)
            .unwrap_or_default()
            .to_string();
        let passwords = entry
            .values(PASSWORD_ATTRIBUTE)
            .unwrap_or_default()
            .iter()
            .filter_map(|value| match StoredPassword::parse(value) {
                Ok(password) => Some(password),
                Err(err) => {
                    tracing::warn!(dn = %entry.dn, error = %err, "ignoring unusable userPassword value");
                    None
                }
            })
            .collect();
        let privileges = entry
            .values(PRIVILEGE_ATTRIBUTE)
            .unwrap_or_default()
            .iter()
            .filter_map(|name| Privilege::parse(name))
            .collect();
        UserRecord {
            dn: entry.dn.clone(),
            username,
            passwords,
            privileges,
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn require_authenticated(auth: &AuthState, action: &str) -> Result<(), BackendError> {
    if auth.effective_identity().is_none() {
        return Err(BackendError::InsufficientAccess(format!(
            "anonymous clients may not {action} entries"
        )));
    }
    Ok(())
}

impl Backend for InMemoryDirectory {
    fn execute(&self, operation: &Operation, auth: &AuthState) -> Result<LdapResult, BackendError> {
        match operation.request() {
            Request::Search(request) => self.search(operation, request, auth),
            Request::Add(request) => self.add(operation, request, auth),
            Request::Delete(request) => self.delete(operation, request, auth),
            Request::Modify(request) => self.modify(operation, request, auth),
            Request::Compare(request) => self.compare(operation, request, auth),
            Request::Extended(request) => Self::extended(operation, request, auth),
            Request::Bind(_) | Request::Abandon(_) => Err(BackendError::Internal(anyhow::anyhow!(
                "{} operations are handled by the dispatcher",
                operation.kind()
            ))),
        }
    }
}

impl IdentityMapper for InMemoryDirectory {
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, BackendError> {
        let entries = self.entries.read();
        Ok(entries
            .values()
            .find(|entry| {
                entry
                    .values(LOGIN_ATTRIBUTE)
                    .is_some_and(|ids| ids.iter().any(|id| id.eq_ignore_ascii_case(username)))
            })
            .map(Self::user_record))
    }

    fn find_by_dn(&self, dn: &Dn) -> Result<Option<UserRecord>, BackendError> {
        Ok(self.entries.read().get(dn).map(Self::user_record))
    }
}

#[cfg(test)]
mod tests {
    use ldapd_core::{ConnectionId, MessageId, Modification};

    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn directory() -> InMemoryDirectory {
        let dir = InMemoryDirectory::new().with_restricted_subtree(dn("ou=secret,o=test"));
        dir.insert(Entry::new(dn("o=test")).with("objectClass", "organization"));
        dir.insert(Entry::new(dn("ou=people,o=test")).with("objectClass", "organizationalUnit"));
        dir.insert(Entry::new(dn("ou=secret,o=test")).with("objectClass", "organizationalUnit"));
        dir.insert(
            Entry::new(dn("uid=alice,ou=people,o=test"))
                .with("objectClass", "person")
                .with("uid", "alice")
                .with("cn", "Alice")
                .with("userPassword", "{CLEAR}wonderland")
                .with("ds-privilege-name", "proxied-auth"),
        );
        dir.insert(Entry::new(dn("cn=plans,ou=secret,o=test")).with("objectClass", "document"));
        dir
    }

    fn alice() -> AuthState {
        AuthState::authenticated(dn("uid=alice,ou=people,o=test"), None)
    }

    fn run(dir: &InMemoryDirectory, request: Request, auth: &AuthState) -> Result<LdapResult, BackendError> {
        let op = Operation::new(ConnectionId(1), MessageId(1), request);
        dir.execute(&op, auth)
    }

    fn search(base: &str, scope: SearchScope, filter: Filter) -> Request {
        Request::Search(SearchRequest::new(dn(base), scope, filter))
    }

    #[test]
    fn anonymous_cannot_see_restricted_subtree() {
        let dir = directory();
        let anonymous = AuthState::anonymous();

        let result = run(&dir, search("o=test", SearchScope::Subtree, Filter::match_all()), &anonymous).unwrap();
        assert_eq!(result.entries.len(), 3);

        let result = run(&dir, search("o=test", SearchScope::Subtree, Filter::match_all()), &alice()).unwrap();
        assert_eq!(result.entries.len(), 5);

        let hidden = run(&dir, search("ou=secret,o=test", SearchScope::Base, Filter::match_all()), &anonymous);
        assert!(matches!(hidden, Err(BackendError::NoSuchObject(_))));
    }

    #[test]
    fn passwords_are_never_returned() {
        let dir = directory();
        let result = run(
            &dir,
            search("uid=alice,ou=people,o=test", SearchScope::Base, Filter::match_all()),
            &alice(),
        )
        .unwrap();
        assert!(!result.entries[0].has_attribute("userPassword"));
        assert_eq!(result.entries[0].first_value("cn"), Some("Alice"));
    }

    #[test]
    fn scopes_and_size_limit() {
        let dir = directory();
        let one = run(&dir, search("o=test", SearchScope::OneLevel, Filter::match_all()), &alice()).unwrap();
        assert_eq!(one.entries.len(), 2);

        let mut limited = SearchRequest::new(dn("o=test"), SearchScope::Subtree, Filter::match_all());
        limited.size_limit = 2;
        let result = run(&dir, Request::Search(limited), &alice()).unwrap();
        assert_eq!(result.code, ResultCode::SizeLimitExceeded);
        assert_eq!(result.entries.len(), 2);
    }

    #[test]
    fn virtual_attribute_in_filter_and_projection() {
        let dir = directory();
        let mut request = SearchRequest::new(
            dn("o=test"),
            SearchScope::Subtree,
            Filter::Equality("hasSubordinates".into(), "TRUE".into()),
        );
        request.attributes = vec!["hasSubordinates".into()];
        let result = run(&dir, Request::Search(request), &alice()).unwrap();
        let dns: Vec<String> = result.entries.iter().map(|e| e.dn.to_string()).collect();
        assert_eq!(result.entries.len(), 3, "{dns:?}");
        assert!(result.entries.iter().all(|e| e.first_value("hasSubordinates") == Some("TRUE")));
    }

    #[test]
    fn cancelled_search_stops() {
        let dir = directory();
        let op = Operation::new(
            ConnectionId(1),
            MessageId(1),
            search("o=test", SearchScope::Subtree, Filter::match_all()),
        );
        op.cancel();
        assert!(matches!(dir.execute(&op, &alice()), Err(BackendError::Canceled)));
    }

    #[test]
    fn writes_need_identity_and_parents() {
        let dir = directory();
        let add = Request::Add(AddRequest {
            entry: Entry::new(dn("uid=bob,ou=people,o=test")).with("uid", "bob"),
        });
        assert!(matches!(
            run(&dir, add.clone(), &AuthState::anonymous()),
            Err(BackendError::InsufficientAccess(_))
        ));
        run(&dir, add.clone(), &alice()).unwrap();
        assert!(matches!(run(&dir, add, &alice()), Err(BackendError::AlreadyExists(_))));

        let orphan = Request::Add(AddRequest {
            entry: Entry::new(dn("uid=x,ou=missing,o=test")),
        });
        assert!(matches!(run(&dir, orphan, &alice()), Err(BackendError::NoSuchObject(_))));

        let non_leaf = Request::Delete(DeleteRequest { dn: dn("ou=people,o=test") });
        assert!(matches!(
            run(&dir, non_leaf, &alice()),
            Err(BackendError::NotAllowedOnNonLeaf(_))
        ));
        run(&dir, Request::Delete(DeleteRequest { dn: dn("uid=bob,ou=people,o=test") }), &alice()).unwrap();
        assert!(dir.get(&dn("uid=bob,ou=people,o=test")).is_none());
    }

    #[test]
    fn modify_is_all_or_nothing() {
        let dir = directory();
        let target = dn("uid=alice,ou=people,o=test");
        let request = Request::Modify(ModifyRequest {
            dn: target.clone(),
            changes: vec![
                Modification {
                    kind: ModificationType::Replace,
                    attribute: "cn".into(),
                    values: vec!["Alice Liddell".into()],
                },
                Modification {
                    kind: ModificationType::Delete,
                    attribute: "mail".into(),
                    values: vec![],
                },
            ],
        });
        assert!(matches!(run(&dir, request, &alice()), Err(BackendError::NoSuchAttribute(_))));
        assert_eq!(dir.get(&target).unwrap().first_value("cn"), Some("Alice"));
    }

    #[test]
    fn compare_is_three_valued() {
        let dir = directory();
        let compare = |attribute: &str, value: &str| {
            run(
                &dir,
                Request::Compare(CompareRequest {
                    dn: dn("ou=people,o=test"),
                    attribute: attribute.into(),
                    value: value.into(),
                }),
                &alice(),
            )
        };
        assert_eq!(compare("hasSubordinates", "TRUE").unwrap().code, ResultCode::CompareTrue);
        assert_eq!(compare("objectClass", "person").unwrap().code, ResultCode::CompareFalse);
        assert!(matches!(compare("hasSubordinates", "perhaps"), Err(BackendError::NoSuchAttribute(_))));
        assert!(matches!(compare("mail", "x"), Err(BackendError::NoSuchAttribute(_))));
    }

    #[test]
    fn who_am_i() {
        let dir = directory();
        let request = Request::Extended(ExtendedRequest {
            oid: WHO_AM_I_OID.into(),
            value: None,
        });
        let anonymous = run(&dir, request.clone(), &AuthState::anonymous()).unwrap();
        assert_eq!(anonymous.response_value, Some(Bytes::new()));

        let bound = run(&dir, request, &alice()).unwrap();
        assert_eq!(
            bound.response_value,
            Some(Bytes::from("dn:uid=alice,ou=people,o=test"))
        );

        let unknown = Request::Extended(ExtendedRequest {
            oid: "1.2.3".into(),
            value: None,
        });
        assert!(matches!(run(&dir, unknown, &alice()), Err(BackendError::Protocol(_))));
    }

    #[test]
    fn identity_lookup() {
        let dir = directory();
        let by_name = dir.find_by_username("ALICE").unwrap().unwrap();
        assert_eq!(by_name.dn, dn("uid=alice,ou=people,o=test"));
        assert!(by_name.verify_password(b"wonderland"));
        assert!(by_name.has_privilege(Privilege::ProxiedAuth));

        assert!(dir.find_by_dn(&dn("uid=alice,ou=people,o=test")).unwrap().is_some());
        assert!(dir.find_by_username("nobody").unwrap().is_none());
    }
}
