//! services/api/src/web/identity.rs
//!
//! Maps a platform user onto the client record the booking tables refer to.

use booking_core::domain::{Client, User};
use booking_core::ports::{DatabaseService, PortResult};

use crate::adapters::whatsapp::digits_only;

/// Finds the caller's client record. Precedence: linked by user id, then same
/// email, then same phone number compared on digits only. Contact matches only
/// count for records not yet linked to another user.
pub async fn resolve_client(
    db: &dyn DatabaseService,
    user: &User,
    phone: Option<&str>,
) -> PortResult<Option<Client>> {
    if let Some(client) = db.find_client_by_user(user.user_id).await? {
        return Ok(Some(client));
    }
    let claimable = |client: &Client| client.user_id.is_none() || client.user_id == Some(user.user_id);
    if let Some(client) = db.find_client_by_email(&user.email).await?.filter(claimable) {
        return Ok(Some(client));
    }
    match phone.map(digits_only).filter(|d| !d.is_empty()) {
        Some(digits) => Ok(db.find_client_by_phone(&digits).await?.filter(claimable)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryDatabase;
    use booking_core::domain::{NewClient, Role};
    use uuid::Uuid;

    fn user(email: &str) -> User {
        User {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            role: Role::Client,
        }
    }

    #[tokio::test]
    async fn linked_client_wins_over_email_match() {
        let db = InMemoryDatabase::new();
        let caller = user("asha@example.com");
        db.create_client(NewClient {
            user_id: None,
            name: "Asha (walk-in)".to_string(),
            email: Some("asha@example.com".to_string()),
            phone: None,
        })
        .await
        .unwrap();
        let linked = db
            .create_client(NewClient {
                user_id: Some(caller.user_id),
                name: "Asha".to_string(),
                email: Some("other@example.com".to_string()),
                phone: None,
            })
            .await
            .unwrap();

        let found = resolve_client(&db, &caller, None).await.unwrap().unwrap();
        assert_eq!(found.id, linked.id);
    }

    #[tokio::test]
    async fn phone_match_ignores_formatting() {
        let db = InMemoryDatabase::new();
        let stored = db
            .create_client(NewClient {
                user_id: None,
                name: "Ravi".to_string(),
                email: None,
                phone: Some("98765 43210".to_string()),
            })
            .await
            .unwrap();

        let found = resolve_client(&db, &user("ravi@example.com"), Some("+91 (987) 654-3210"))
            .await
            .unwrap();
        assert!(found.is_none(), "country code makes the digits differ");

        let found = resolve_client(&db, &user("ravi@example.com"), Some("987-654-3210"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, stored.id);
    }

    #[tokio::test]
    async fn client_linked_to_another_user_is_not_handed_out() {
        let db = InMemoryDatabase::new();
        let owner = user("shared@example.com");
        db.create_client(NewClient {
            user_id: Some(owner.user_id),
            name: "Asha".to_string(),
            email: Some("shared@example.com".to_string()),
            phone: Some("9876543210".to_string()),
        })
        .await
        .unwrap();

        let stranger = user("shared@example.com");
        let found = resolve_client(&db, &stranger, Some("9876543210")).await.unwrap();
        assert!(found.is_none());

        let found = resolve_client(&db, &owner, None).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn unknown_caller_resolves_to_none() {
        let db = InMemoryDatabase::new();
        let found = resolve_client(&db, &user("nobody@example.com"), None).await.unwrap();
        assert!(found.is_none());
    }
}
