use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the users table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// `USER#<user_id>`, never reassigned.
    pub pk: String,
    pub user_id: Uuid,
    /// Normalized; unique across the table.
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_email_verified: bool,
    #[serde(default)]
    pub s3_keys: Vec<String>,
}

impl UserRecord {
    pub fn new(
        user_id: Uuid,
        email: String,
        hashed_password: String,
        display_name: Option<String>,
    ) -> Self {
        Self {
            pk: Self::primary_key(user_id),
            user_id,
            email,
            hashed_password,
            display_name,
            created_at: OffsetDateTime::now_utc(),
            is_email_verified: false,
            s3_keys: Vec::new(),
        }
    }

    pub fn primary_key(user_id: Uuid) -> String {
        format!("USER#{user_id}")
    }
}

/// Everything stored about a user except the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub pk: String,
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_email_verified: bool,
    pub s3_keys: Vec<String>,
}

impl From<UserRecord> for UserProfile {
    fn from(u: UserRecord) -> Self {
        Self {
            pk: u.pk,
            user_id: u.user_id,
            email: u.email,
            display_name: u.display_name,
            created_at: u.created_at,
            is_email_verified: u.is_email_verified,
            s3_keys: u.s3_keys,
        }
    }
}

/// Public part of the user returned on login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
}

impl From<&UserRecord> for PublicUser {
    fn from(u: &UserRecord) -> Self {
        let display_name = u
            .display_name
            .clone()
            .unwrap_or_else(|| u.email.split('@').next().unwrap_or_default().to_string());
        Self {
            user_id: u.user_id,
            email: u.email.clone(),
            display_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UserRecord {
        UserRecord::new(
            Uuid::new_v4(),
            "jane@example.com".into(),
            "$argon2id$v=19$secret".into(),
            None,
        )
    }

    #[test]
    fn new_record_defaults() {
        let u = sample();
        assert_eq!(u.pk, format!("USER#{}", u.user_id));
        assert!(!u.is_email_verified);
        assert!(u.s3_keys.is_empty());
    }

    #[test]
    fn record_json_never_contains_hash() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("hashedPassword").is_none());
        assert_eq!(json["email"], "jane@example.com");
        assert_eq!(json["isEmailVerified"], false);
    }

    #[test]
    fn profile_json_shape() {
        let json = serde_json::to_value(UserProfile::from(sample())).unwrap();
        assert!(json.get("hashedPassword").is_none());
        assert!(json.get("userId").is_some());
        assert!(json.get("createdAt").unwrap().is_string());
        assert_eq!(json["s3Keys"], serde_json::json!([]));
    }

    #[test]
    fn public_user_falls_back_to_email_local_part() {
        let u = sample();
        assert_eq!(PublicUser::from(&u).display_name, "jane");

        let mut named = sample();
        named.display_name = Some("Jane D".into());
        assert_eq!(PublicUser::from(&named).display_name, "Jane D");
    }
}
