use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::db;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Secretary,
    Teacher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ViewRoster,
    ManageClasses,
    ManageStudents,
    ManageUsers,
    DeleteUsers,
    ProvisionAdmins,
    TakeAttendance,
    EnterGrades,
    PrintReports,
    SendTestNotification,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::ViewRoster,
        Capability::ManageClasses,
        Capability::ManageStudents,
        Capability::ManageUsers,
        Capability::DeleteUsers,
        Capability::ProvisionAdmins,
        Capability::TakeAttendance,
        Capability::EnterGrades,
        Capability::PrintReports,
        Capability::SendTestNotification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ViewRoster => "viewRoster",
            Capability::ManageClasses => "manageClasses",
            Capability::ManageStudents => "manageStudents",
            Capability::ManageUsers => "manageUsers",
            Capability::DeleteUsers => "deleteUsers",
            Capability::ProvisionAdmins => "provisionAdmins",
            Capability::TakeAttendance => "takeAttendance",
            Capability::EnterGrades => "enterGrades",
            Capability::PrintReports => "printReports",
            Capability::SendTestNotification => "sendTestNotification",
        }
    }
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Secretary => "secretary",
            Role::Teacher => "teacher",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "admin" => Some(Role::Admin),
            "secretary" => Some(Role::Secretary),
            "teacher" => Some(Role::Teacher),
            _ => None,
        }
    }

    pub fn can(self, cap: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Admin => true,
            Role::Secretary => matches!(
                cap,
                ViewRoster | ManageClasses | ManageStudents | ManageUsers | PrintReports
            ),
            Role::Teacher => matches!(
                cap,
                ViewRoster | TakeAttendance | EnterGrades | PrintReports | SendTestNotification
            ),
        }
    }

    pub fn capabilities(self) -> Vec<Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(|c| self.can(*c))
            .collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

/// Stored role document, keyed by identity id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Raw stored value; unknown strings resolve to no role.
    pub role: String,
    pub subject: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub role: Option<Role>,
    pub subject: Option<String>,
}

impl SessionUser {
    pub fn can(&self, cap: Capability) -> bool {
        self.role.map(|r| r.can(cap)).unwrap_or(false)
    }

    pub fn is_teacher(&self) -> bool {
        self.role == Some(Role::Teacher)
    }

    pub fn capabilities(&self) -> Vec<&'static str> {
        self.role
            .map(|r| r.capabilities().into_iter().map(Capability::as_str).collect())
            .unwrap_or_default()
    }

    fn bare(identity: &Identity) -> SessionUser {
        SessionUser {
            id: identity.id.clone(),
            email: identity.email.clone(),
            name: None,
            phone: None,
            role: None,
            subject: None,
        }
    }
}

/// Super-admin email wins over any stored record; a missing record means teacher; a
/// failed lookup leaves the identity without a role.
pub fn resolve_session_user<E: fmt::Display>(
    identity: &Identity,
    super_admin_email: &str,
    lookup: impl FnOnce(&str) -> Result<Option<RoleRecord>, E>,
) -> SessionUser {
    let mut user = SessionUser::bare(identity);
    if identity.email.eq_ignore_ascii_case(super_admin_email.trim()) {
        user.role = Some(Role::Admin);
        return user;
    }
    match lookup(&identity.id) {
        Ok(Some(record)) => {
            user.name = Some(record.name);
            user.phone = record.phone;
            user.role = Role::parse(&record.role);
            user.subject = record.subject;
            if user.role.is_none() {
                tracing::warn!(user_id = %identity.id, role = %record.role, "unknown stored role");
            }
        }
        Ok(None) => user.role = Some(Role::Teacher),
        Err(e) => {
            tracing::error!(user_id = %identity.id, error = %e, "role lookup failed");
        }
    }
    user
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("password must be at least 6 characters")]
    WeakPassword,
    #[error("this email is already registered")]
    EmailAlreadyInUse,
    #[error("invalid email")]
    InvalidEmail,
    #[error("login failed, check credentials")]
    InvalidCredentials,
    #[error("session not found")]
    SessionNotFound,
    #[error("password hashing failed: {0}")]
    Hashing(argon2::password_hash::Error),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::WeakPassword => "auth/weak-password",
            AuthError::EmailAlreadyInUse => "auth/email-already-in-use",
            AuthError::InvalidEmail => "auth/invalid-email",
            AuthError::InvalidCredentials => "auth/invalid-credential",
            AuthError::SessionNotFound => "auth/session-not-found",
            AuthError::Hashing(_) => "auth/internal-error",
            AuthError::Storage(_) => "db_query_failed",
        }
    }

    /// Sign-in never reveals which part was wrong.
    pub fn sign_in_message(&self) -> String {
        AuthError::InvalidCredentials.to_string()
    }

    pub fn sign_up_message(&self) -> String {
        match self {
            AuthError::Storage(e) => format!("could not create account: {}", e),
            other => other.to_string(),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
            .unwrap_or(false)
}

/// PHC string (`$argon2id$...`) with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes()).map_err(AuthError::Hashing)?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(AuthError::Hashing)?;
    Ok(hash.to_string())
}

/// Unparsable stored hashes never match.
pub fn password_matches(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Validates and stores a new identity. Does not open a session.
pub fn create_identity(conn: &Connection, email: &str, password: &str) -> Result<Identity, AuthError> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AuthError::InvalidEmail);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM identities WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    if taken.is_some() {
        return Err(AuthError::EmailAlreadyInUse);
    }

    let id = Uuid::new_v4().to_string();
    let password_hash = hash_password(password)?;
    conn.execute(
        "INSERT INTO identities(id, email, password_hash, created_at) VALUES(?, ?, ?, ?)",
        (&id, &email, &password_hash, db::now_rfc3339()),
    )?;
    Ok(Identity { id, email })
}

pub fn verify_credentials(
    conn: &Connection,
    email: &str,
    password: &str,
) -> Result<Identity, AuthError> {
    let email = normalize_email(email);
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM identities WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((id, stored)) = row else {
        return Err(AuthError::InvalidCredentials);
    };
    if !password_matches(password, &stored) {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(Identity { id, email })
}

pub fn open_session(conn: &Connection, identity: &Identity) -> Result<String, AuthError> {
    let token = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO sessions(token, identity_id, created_at) VALUES(?, ?, ?)",
        (&token, &identity.id, db::now_rfc3339()),
    )?;
    Ok(token)
}

pub fn restore_session(conn: &Connection, token: &str) -> Result<Identity, AuthError> {
    conn.query_row(
        "SELECT i.id, i.email FROM sessions s JOIN identities i ON i.id = s.identity_id
         WHERE s.token = ?",
        [token],
        |r| {
            Ok(Identity {
                id: r.get(0)?,
                email: r.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or(AuthError::SessionNotFound)
}

pub fn close_session(conn: &Connection, token: &str) -> Result<bool, AuthError> {
    Ok(conn.execute("DELETE FROM sessions WHERE token = ?", [token])? > 0)
}

pub fn load_role_record(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<RoleRecord>> {
    conn.query_row(
        "SELECT id, name, email, phone, role, subject, created_at FROM users WHERE id = ?",
        [user_id],
        role_record_from_row,
    )
    .optional()
}

fn role_record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RoleRecord> {
    Ok(RoleRecord {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        role: r.get(4)?,
        subject: r.get(5)?,
        created_at: r.get(6)?,
    })
}

pub fn list_role_records(conn: &Connection) -> rusqlite::Result<Vec<RoleRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, phone, role, subject, created_at
         FROM users ORDER BY name COLLATE NOCASE, created_at",
    )?;
    let rows = stmt
        .query_map([], role_record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub phone: Option<&'a str>,
    pub password: &'a str,
    pub role: Role,
    pub subject: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Identity(AuthError),
    #[error("{0}")]
    RoleRecord(rusqlite::Error),
}

/// Creates identity and role record together. The caller's own session is untouched.
pub fn provision_user(conn: &Connection, new_user: &NewUser<'_>) -> Result<RoleRecord, ProvisionError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(ProvisionError::RoleRecord)?;
    let identity =
        create_identity(&tx, new_user.email, new_user.password).map_err(ProvisionError::Identity)?;
    let subject = match new_user.role {
        Role::Teacher => new_user.subject.map(str::to_string),
        _ => None,
    };
    let record = RoleRecord {
        id: identity.id.clone(),
        name: new_user.name.trim().to_string(),
        email: identity.email.clone(),
        phone: new_user.phone.map(str::to_string),
        role: new_user.role.as_str().to_string(),
        subject,
        created_at: db::now_rfc3339(),
    };
    tx.execute(
        "INSERT INTO users(id, name, email, phone, role, subject, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &record.name,
            &record.email,
            record.phone.as_deref(),
            &record.role,
            record.subject.as_deref(),
            &record.created_at,
        ),
    )
    .map_err(ProvisionError::RoleRecord)?;
    tx.commit().map_err(ProvisionError::RoleRecord)?;
    Ok(record)
}

/// Removes the role record only; the identity can still sign in (as a teacher).
pub fn delete_role_record(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM users WHERE id = ?", [user_id])? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPER: &str = "head@school.test";

    fn identity(email: &str) -> Identity {
        Identity {
            id: "u1".to_string(),
            email: email.to_string(),
        }
    }

    fn record(role: &str) -> RoleRecord {
        RoleRecord {
            id: "u1".to_string(),
            name: "Rita".to_string(),
            email: "rita@school.test".to_string(),
            phone: None,
            role: role.to_string(),
            subject: Some("Math".to_string()),
            created_at: "now".to_string(),
        }
    }

    #[test]
    fn capability_table() {
        assert!(Role::Admin.can(Capability::ProvisionAdmins));
        assert!(Role::Secretary.can(Capability::ManageClasses));
        assert!(Role::Secretary.can(Capability::ManageUsers));
        assert!(!Role::Secretary.can(Capability::DeleteUsers));
        assert!(!Role::Secretary.can(Capability::TakeAttendance));
        assert!(Role::Teacher.can(Capability::TakeAttendance));
        assert!(Role::Teacher.can(Capability::EnterGrades));
        assert!(!Role::Teacher.can(Capability::ManageStudents));
        assert_eq!(Role::Admin.capabilities().len(), Capability::ALL.len());
    }

    #[test]
    fn super_admin_email_ignores_stored_record() {
        let user = resolve_session_user(&identity("Head@School.test"), SUPER, |_| {
            Ok::<_, rusqlite::Error>(Some(record("teacher")))
        });
        assert_eq!(user.role, Some(Role::Admin));
        assert!(user.subject.is_none());
    }

    #[test]
    fn missing_record_defaults_to_teacher() {
        let user = resolve_session_user(&identity("x@school.test"), SUPER, |_| {
            Ok::<_, rusqlite::Error>(None)
        });
        assert_eq!(user.role, Some(Role::Teacher));
        assert!(user.subject.is_none());
    }

    #[test]
    fn stored_record_merges_onto_identity() {
        let user = resolve_session_user(&identity("rita@school.test"), SUPER, |_| {
            Ok::<_, rusqlite::Error>(Some(record("secretary")))
        });
        assert_eq!(user.role, Some(Role::Secretary));
        assert_eq!(user.name.as_deref(), Some("Rita"));
        assert_eq!(user.subject.as_deref(), Some("Math"));
    }

    #[test]
    fn lookup_failure_and_unknown_role_grant_nothing() {
        let failed = resolve_session_user(&identity("x@school.test"), SUPER, |_| {
            Err::<Option<RoleRecord>, _>("network down")
        });
        assert_eq!(failed.role, None);
        assert!(Capability::ALL.iter().all(|c| !failed.can(*c)));
        assert!(failed.capabilities().is_empty());

        let odd = resolve_session_user(&identity("x@school.test"), SUPER, |_| {
            Ok::<_, rusqlite::Error>(Some(record("janitor")))
        });
        assert_eq!(odd.role, None);
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a b@c.de"));
        assert!(!is_valid_email("a@@c.de"));
    }

    #[test]
    fn sign_up_errors_are_classified() {
        let conn = db::open_in_memory();
        assert_eq!(
            create_identity(&conn, "bad", "secret1").unwrap_err().code(),
            "auth/invalid-email"
        );
        assert_eq!(
            create_identity(&conn, "a@b.co", "12345").unwrap_err().code(),
            "auth/weak-password"
        );
        create_identity(&conn, "a@b.co", "123456").expect("create");
        let dup = create_identity(&conn, " A@B.CO ", "123456").unwrap_err();
        assert_eq!(dup.code(), "auth/email-already-in-use");
        assert_eq!(dup.sign_up_message(), "this email is already registered");
    }

    #[test]
    fn stored_passwords_are_salted_argon2id() {
        let conn = db::open_in_memory();
        create_identity(&conn, "a@school.test", "secret1").expect("create");
        create_identity(&conn, "b@school.test", "secret1").expect("create");
        let mut stmt = conn
            .prepare("SELECT password_hash FROM identities ORDER BY email")
            .expect("prepare");
        let hashes: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("hashes");
        assert!(hashes.iter().all(|h| h.starts_with("$argon2id$")));
        assert_ne!(hashes[0], hashes[1]);
        assert!(password_matches("secret1", &hashes[0]));
        assert!(!password_matches("secret2", &hashes[0]));
        assert!(!password_matches("secret1", "not-a-phc-string"));
    }

    #[test]
    fn credentials_and_sessions() {
        let conn = db::open_in_memory();
        let created = create_identity(&conn, "t@school.test", "secret1").expect("create");
        let err = verify_credentials(&conn, "t@school.test", "wrong").unwrap_err();
        assert_eq!(err.sign_in_message(), "login failed, check credentials");
        assert!(verify_credentials(&conn, "nobody@school.test", "secret1").is_err());

        let ident = verify_credentials(&conn, "T@school.test", "secret1").expect("verify");
        assert_eq!(ident, created);

        let token = open_session(&conn, &ident).expect("session");
        assert_eq!(restore_session(&conn, &token).expect("restore"), ident);
        assert!(close_session(&conn, &token).expect("close"));
        assert!(matches!(
            restore_session(&conn, &token),
            Err(AuthError::SessionNotFound)
        ));
    }

    #[test]
    fn provisioning_is_all_or_nothing_and_deletion_keeps_identity() {
        let conn = db::open_in_memory();
        let rec = provision_user(
            &conn,
            &NewUser {
                name: "Paulo",
                email: "paulo@school.test",
                phone: Some("555"),
                password: "secret1",
                role: Role::Teacher,
                subject: Some("History"),
            },
        )
        .expect("provision");
        assert_eq!(rec.subject.as_deref(), Some("History"));

        let weak = provision_user(
            &conn,
            &NewUser {
                name: "Weak",
                email: "weak@school.test",
                phone: None,
                password: "123",
                role: Role::Secretary,
                subject: Some("ignored"),
            },
        );
        assert!(matches!(weak, Err(ProvisionError::Identity(AuthError::WeakPassword))));
        assert_eq!(list_role_records(&conn).expect("list").len(), 1);

        assert!(delete_role_record(&conn, &rec.id).expect("delete"));
        assert!(verify_credentials(&conn, "paulo@school.test", "secret1").is_ok());
        assert!(load_role_record(&conn, &rec.id).expect("load").is_none());
    }
}
