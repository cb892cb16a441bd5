use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::SignupRequest,
    password::{check_new_password, hash_password, verify_password},
    session::Session,
};
use crate::{
    error::{AppError, AppResult},
    ledger::updater::retry_on_conflict,
    notify::{mailer::OutgoingMail, tasks::enqueue_pay_request_emails, templates},
    state::AppState,
    store::{PayRequestQuery, RecordStore, TokenKind, TokenRecord, User},
};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref FULL_NAME_RE: Regex = Regex::new(r"^(?:\S+ )+\S+$").unwrap();
}

/// Trims and lower-cases `raw`, rejecting anything that is not an address.
pub fn parse_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if !EMAIL_RE.is_match(&email) {
        return Err(AppError::Validation(format!("Invalid email: {raw:?}")));
    }
    Ok(email)
}

/// First and last name at least, single spaces between words.
pub fn parse_full_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if !FULL_NAME_RE.is_match(name) {
        return Err(AppError::Validation(
            "Please enter your first and last name".into(),
        ));
    }
    Ok(name.to_string())
}

#[instrument(skip(state, password))]
pub async fn login(state: &AppState, email: &str, password: &str) -> AppResult<(User, Session)> {
    let email = parse_email(email)?;
    let invalid = || AppError::Authentication("Invalid credentials".into());

    let Some(user) = state.store.find_user_by_email(&email).await? else {
        warn!(%email, "login unknown email");
        return Err(invalid());
    };
    if !verify_password(password, &user.password_hash)? {
        warn!(%email, user_id = %user.id, "login invalid password");
        return Err(invalid());
    }

    info!(user_id = %user.id, %email, "user logged in");
    let session = Session::new(user.id, user.email.clone(), user.full_name.clone());
    Ok((user, session))
}

/// Creates the account, then sends the verification link. A failed send
/// fails the call even though the account already exists.
#[instrument(skip(state, req), fields(email = %req.email))]
pub async fn signup(state: &AppState, req: &SignupRequest) -> AppResult<(User, Session)> {
    let full_name = parse_full_name(&req.full_name)?;
    let email = parse_email(&req.email)?;
    check_new_password(&req.password)?;
    let payout_email = if req.same_as_email {
        email.clone()
    } else {
        parse_email(req.payout_email.as_deref().unwrap_or_default())?
    };

    let user = User {
        id: Uuid::new_v4(),
        email,
        password_hash: hash_password(&req.password)?,
        full_name,
        payout_email,
        email_ok: false,
        created_at: OffsetDateTime::now_utc(),
    };

    let new_user = &user;
    retry_on_conflict("signup", || async move {
        let mut tx = state.store.begin().await?;
        if tx.find_user_id_by_email(&new_user.email).await?.is_some() {
            return Err(AppError::Conflict("User already exists".into()));
        }
        tx.insert_user(new_user).await?;
        tx.commit().await?;
        Ok(())
    })
    .await
    .map_err(|e| {
        warn!(error = %e, "signup rejected");
        e
    })?;

    info!(user_id = %user.id, "user signed up");
    let session = Session::new(user.id, user.email.clone(), user.full_name.clone());
    initiate_verify_email(state, &session).await?;
    Ok((user, session))
}

/// Loads one user, checks `current_password` if given, applies `f` and writes
/// the user back when `f` reports a change. Returns the user as stored.
pub async fn update_user<F>(
    store: &dyn RecordStore,
    user_id: Uuid,
    current_password: Option<&str>,
    f: F,
) -> AppResult<(User, bool)>
where
    F: Fn(&mut User) -> bool + Send + Sync,
{
    let f = &f;
    retry_on_conflict("update user", || async move {
        let mut tx = store.begin().await?;
        let mut user = tx.get_user(user_id).await?;
        if let Some(password) = current_password {
            if !verify_password(password, &user.password_hash)? {
                return Err(AppError::Authentication("Current password is incorrect".into()));
            }
        }
        let changed = f(&mut user);
        if changed {
            tx.put_user(&user).await?;
            tx.commit().await?;
        }
        Ok((user, changed))
    })
    .await
}

#[instrument(skip(state, current, new), fields(user_id = %session.user_id))]
pub async fn change_password(
    state: &AppState,
    session: &Session,
    current: &str,
    new: &str,
) -> AppResult<()> {
    check_new_password(new)?;
    let hash = hash_password(new)?;
    update_user(state.store.as_ref(), session.user_id, Some(current), |u| {
        u.password_hash = hash.clone();
        true
    })
    .await?;
    info!("password changed");
    Ok(())
}

/// Sets a new password with a reset link instead of the current password.
#[instrument(skip(state, key, new))]
pub async fn reset_password(state: &AppState, key: &str, new: &str) -> AppResult<()> {
    check_new_password(new)?;
    let user_id = use_token(state, TokenKind::ResetPassword, key).await?;
    let hash = hash_password(new)?;
    update_user(state.store.as_ref(), user_id, None, |u| {
        u.password_hash = hash.clone();
        true
    })
    .await?;
    info!(%user_id, "password reset");
    Ok(())
}

/// Saves name and payout email. When the name changed the returned session
/// carries it; its creation time, and so its expiry, is unchanged.
#[instrument(skip(state), fields(user_id = %session.user_id))]
pub async fn update_profile(
    state: &AppState,
    session: &Session,
    full_name: &str,
    payout_email: &str,
) -> AppResult<(User, Option<Session>)> {
    let full_name = parse_full_name(full_name)?;
    let payout_email = parse_email(payout_email)?;

    let (user, _) = update_user(state.store.as_ref(), session.user_id, None, |u| {
        if u.full_name == full_name && u.payout_email == payout_email {
            return false;
        }
        u.full_name = full_name.clone();
        u.payout_email = payout_email.clone();
        true
    })
    .await?;

    let renewed = (user.full_name != session.full_name).then(|| Session {
        full_name: user.full_name.clone(),
        ..session.clone()
    });
    Ok((user, renewed))
}

#[derive(Serialize)]
struct VerifyEmailMail<'a> {
    full_name: &'a str,
    verify_url: String,
}

#[derive(Serialize)]
struct ResetPasswordMail<'a> {
    full_name: &'a str,
    email: &'a str,
    reset_url: String,
}

#[instrument(skip(state), fields(user_id = %session.user_id))]
pub async fn initiate_verify_email(state: &AppState, session: &Session) -> AppResult<()> {
    let token = TokenRecord::new(TokenKind::VerifyEmail, session.user_id, OffsetDateTime::now_utc());
    state.store.put_token(&token).await?;

    let body = state.templates.render(
        templates::VERIFY_EMAIL,
        &VerifyEmailMail {
            full_name: &session.full_name,
            verify_url: state.url(&format!("/api/v1/account/verify?key={}", token.key)),
        },
    )?;
    state
        .mailer
        .send(&OutgoingMail {
            sender: state.config.mail.sender.clone(),
            to: vec![session.email.clone()],
            cc: Vec::new(),
            subject: "Welcome to Paydue".into(),
            body,
        })
        .await
}

/// Mails a reset link. Unknown addresses are logged and otherwise treated as
/// success, so the endpoint does not reveal who has an account.
#[instrument(skip(state))]
pub async fn initiate_reset_password(state: &AppState, email: &str) -> AppResult<()> {
    let email = parse_email(email)?;
    let Some(user) = state.store.find_user_by_email(&email).await? else {
        warn!(%email, "password reset for unknown email");
        return Ok(());
    };

    let token = TokenRecord::new(TokenKind::ResetPassword, user.id, OffsetDateTime::now_utc());
    state.store.put_token(&token).await?;

    let body = state.templates.render(
        templates::RESET_PASSWORD,
        &ResetPasswordMail {
            full_name: &user.full_name,
            email: &user.email,
            reset_url: state.url(&format!("/account/change-password?key={}", token.key)),
        },
    )?;
    state
        .mailer
        .send(&OutgoingMail {
            sender: state.config.mail.sender.clone(),
            to: vec![user.email.clone()],
            cc: Vec::new(),
            subject: "Reset your Paydue password".into(),
            body,
        })
        .await
}

/// Redeems a link key. Tokens stay valid for their whole window; the sweep
/// drops them once expired.
pub async fn use_token(state: &AppState, kind: TokenKind, key: &str) -> AppResult<Uuid> {
    use_token_at(state.store.as_ref(), kind, key, OffsetDateTime::now_utc()).await
}

async fn use_token_at(
    store: &dyn RecordStore,
    kind: TokenKind,
    key: &str,
    now: OffsetDateTime,
) -> AppResult<Uuid> {
    let token = store.get_token(kind, key.trim()).await?;
    if token.is_expired(now) {
        warn!(kind = kind.as_str(), user_id = %token.user_id, "expired link");
        return Err(AppError::Expired(format!(
            "{} link has expired. Please request another.",
            kind.label()
        )));
    }
    Ok(token.user_id)
}

#[instrument(skip(state, key))]
pub async fn verify_email(state: &AppState, key: &str) -> AppResult<User> {
    let user_id = use_token(state, TokenKind::VerifyEmail, key).await?;
    set_email_ok(state, user_id).await
}

/// Marks the user's email verified. The first time, every active unpaid
/// request they created while unverified gets emailed.
pub async fn set_email_ok(state: &AppState, user_id: Uuid) -> AppResult<User> {
    let (user, changed) = update_user(state.store.as_ref(), user_id, None, |u| {
        if u.email_ok {
            return false;
        }
        u.email_ok = true;
        true
    })
    .await?;
    if !changed {
        return Ok(user);
    }

    info!(%user_id, "email verified");
    let pending = state
        .store
        .query_pay_requests(&PayRequestQuery::active(Some(user_id), false))
        .await?;
    let ids = pending.into_iter().map(|r| r.id).collect();
    enqueue_pay_request_emails(state.tasks.as_ref(), ids).await?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tasks::Task;
    use crate::testing::{seed_requests, seed_user, session_for, Harness, PASSWORD};
    use rust_decimal_macros::dec;
    use time::Duration;

    fn signup_request(email: &str) -> SignupRequest {
        SignupRequest {
            full_name: "Pat Payee".into(),
            email: email.into(),
            password: "correct horse".into(),
            payout_email: None,
            same_as_email: true,
        }
    }

    /// Pulls `key=...` out of a mailed link.
    fn link_key(body: &str) -> String {
        let start = body.find("key=").unwrap() + 4;
        body[start..].split_whitespace().next().unwrap().to_string()
    }

    #[test]
    fn emails_are_canonicalized_and_names_need_two_words() {
        assert_eq!(parse_email("  Pat@Example.COM ").unwrap(), "pat@example.com");
        assert!(parse_email("pat@example").is_err());
        assert!(parse_email("pat example.com").is_err());
        assert_eq!(parse_full_name(" Pat Payee ").unwrap(), "Pat Payee");
        assert!(parse_full_name("Pat").is_err());
        assert!(parse_full_name("Pat  Payee").is_err());
    }

    #[tokio::test]
    async fn token_window_is_inclusive_of_47h_and_not_49h() {
        let h = Harness::new();
        let t = OffsetDateTime::now_utc();
        let user_id = Uuid::new_v4();
        let token = TokenRecord::new(TokenKind::VerifyEmail, user_id, t);
        h.store.put_token(&token).await.unwrap();

        let ok = use_token_at(&h.store, TokenKind::VerifyEmail, &token.key, t + Duration::hours(47))
            .await
            .unwrap();
        assert_eq!(ok, user_id);

        let err = use_token_at(&h.store, TokenKind::VerifyEmail, &token.key, t + Duration::hours(49))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));
        assert_eq!(
            err.to_string(),
            "Email verification link has expired. Please request another."
        );

        let wrong_kind = use_token_at(&h.store, TokenKind::ResetPassword, &token.key, t).await;
        assert!(matches!(wrong_kind, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn signup_creates_user_and_mails_verification_link() {
        let h = Harness::new();
        let (user, session) = signup(&h.state, &signup_request("New@Example.com"))
            .await
            .unwrap();
        assert_eq!(user.email, "new@example.com");
        assert_eq!(user.payout_email, "new@example.com");
        assert!(!user.email_ok);
        assert_eq!(session.user_id, user.id);

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["new@example.com".to_string()]);
        assert!(sent[0].body.contains("http://paydue.test/api/v1/account/verify?key="));

        let verified = verify_email(&h.state, &link_key(&sent[0].body)).await.unwrap();
        assert!(verified.email_ok);
    }

    #[tokio::test]
    async fn duplicate_signup_is_a_conflict() {
        let h = Harness::new();
        seed_user(&h.store, "pat@example.com", true).await;
        let err = signup(&h.state, &signup_request("PAT@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn signup_fails_when_verification_mail_fails() {
        let h = Harness::new();
        *h.mailer.fail_to.lock().unwrap() = Some("new@example.com".into());
        let err = signup(&h.state, &signup_request("new@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
        assert!(h.store.find_user_by_email("new@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn login_checks_password() {
        let h = Harness::new();
        let user = seed_user(&h.store, "pat@example.com", true).await;

        let (found, session) = login(&h.state, "Pat@Example.com", PASSWORD).await.unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(session.email, "pat@example.com");

        let wrong = login(&h.state, "pat@example.com", "nope-nope").await.unwrap_err();
        assert!(matches!(wrong, AppError::Authentication(_)));
        let unknown = login(&h.state, "who@example.com", PASSWORD).await.unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn first_verification_emails_pending_requests_once() {
        let h = Harness::new();
        let user = seed_user(&h.store, "pat@example.com", false).await;
        let reqs = seed_requests(&h.store, &user, &[dec!(1), dec!(2)]).await;

        let verified = set_email_ok(&h.state, user.id).await.unwrap();
        assert!(verified.email_ok);
        let tasks = h.tasks.take();
        assert_eq!(tasks.len(), 1);
        let Task::SendPayRequestEmails(mut ids) = tasks[0].clone() else {
            panic!("unexpected task {:?}", tasks[0]);
        };
        ids.sort();
        let mut want: Vec<Uuid> = reqs.iter().map(|r| r.id).collect();
        want.sort();
        assert_eq!(ids, want);

        set_email_ok(&h.state, user.id).await.unwrap();
        assert!(h.tasks.take().is_empty());
    }

    #[tokio::test]
    async fn reset_flow_sets_new_password() {
        let h = Harness::new();
        seed_user(&h.store, "pat@example.com", true).await;

        initiate_reset_password(&h.state, "pat@example.com").await.unwrap();
        initiate_reset_password(&h.state, "ghost@example.com").await.unwrap();
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .body
            .contains("http://paydue.test/account/change-password?key="));

        let key = link_key(&sent[0].body);
        reset_password(&h.state, &key, "brand new pass").await.unwrap();
        assert!(login(&h.state, "pat@example.com", "brand new pass").await.is_ok());
        assert!(login(&h.state, "pat@example.com", PASSWORD).await.is_err());
    }

    #[tokio::test]
    async fn change_password_needs_current_password() {
        let h = Harness::new();
        let user = seed_user(&h.store, "pat@example.com", true).await;
        let session = session_for(&user);

        let err = change_password(&h.state, &session, "wrong-password", "another pass")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));

        change_password(&h.state, &session, PASSWORD, "another pass")
            .await
            .unwrap();
        assert!(login(&h.state, "pat@example.com", "another pass").await.is_ok());
    }

    #[tokio::test]
    async fn renamed_profile_reissues_session_with_same_expiry() {
        let h = Harness::new();
        let user = seed_user(&h.store, "pat@example.com", true).await;
        let session = session_for(&user);

        let (saved, renewed) =
            update_profile(&h.state, &session, "Pat Q Payee", "pay@example.com")
                .await
                .unwrap();
        assert_eq!(saved.payout_email, "pay@example.com");
        let renewed = renewed.unwrap();
        assert_eq!(renewed.full_name, "Pat Q Payee");
        assert_eq!(renewed.expires_at(), session.expires_at());

        let (_, none) = update_profile(&h.state, &session, "Pat Payee", "pay@example.com")
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
