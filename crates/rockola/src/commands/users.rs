//! User management: accounts, registration, cookies.
//!
//! Admin is required across the board, with two carve-outs: a user may
//! always change their own email or password and query their own rights
//! or email. Over non-local transports everything here is additionally
//! gated by the `remote_userman` flag.

use std::rc::Rc;

use rand::RngCore;
use tracing::{info, warn};

use rockoproto::status::{
    AUTH_FAILED, BODY, COOKIE_USER, NOT_AUTHORIZED, NOT_FOUND, NO_VALUE, OK, VALUE,
};
use rockoproto::Rights;

use crate::connection::Connection;
use crate::cookies;
use crate::reactor::children::run_mailer;
use crate::server::Jukebox;
use crate::store::{valid_username, UserRecord};
use crate::unix_now;

/// Non-local user management needs the explicit config opt-in.
fn remote_userman_ok(jb: &Jukebox, conn: &Connection) -> bool {
    conn.shared.local || jb.config.borrow().remote_userman
}

pub(super) fn adduser(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if !remote_userman_ok(jb, conn) {
        conn.reply(NOT_AUTHORIZED, "user management is local-only");
        return;
    }
    let name = &args[0];
    if !valid_username(name) {
        conn.reply(NOT_FOUND, &format!("invalid username {:?}", name));
        return;
    }
    let rights = match args.get(2) {
        Some(spec) => match Rights::parse(spec) {
            Ok(rights) => rights.storable(),
            Err(e) => {
                conn.reply(NOT_FOUND, &e.to_string());
                return;
            }
        },
        None => jb.config.borrow().default_rights,
    };
    let record = UserRecord {
        password: args[1].clone(),
        email: None,
        rights: rights.to_string(),
        confirmation: None,
        revoked_at: None,
        created: unix_now(),
    };
    match jb.store.borrow_mut().create_user(name, record) {
        Ok(true) => {
            info!(user = %name, "user created");
            jb.publish(&format!("user_add {}", name));
            conn.reply(OK, "user created");
        }
        Ok(false) => conn.reply(NOT_FOUND, &format!("cannot create user {:?}", name)),
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn deluser(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if !remote_userman_ok(jb, conn) {
        conn.reply(NOT_AUTHORIZED, "user management is local-only");
        return;
    }
    let name = &args[0];
    match jb.store.borrow_mut().delete_user(name) {
        Ok(true) => {
            info!(user = %name, "user deleted");
            jb.publish(&format!("user_delete {}", name));
            conn.reply(OK, "user deleted");
        }
        Ok(false) => conn.reply(NOT_FOUND, &format!("no such user {:?}", name)),
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn edituser(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if !remote_userman_ok(jb, conn) {
        conn.reply(NOT_AUTHORIZED, "user management is local-only");
        return;
    }
    let (name, key, value) = (&args[0], &args[1], &args[2]);
    let is_self = conn.user().as_deref() == Some(name.as_str());
    let is_admin = conn.rights().contains(Rights::ADMIN);
    let self_editable = matches!(key.as_str(), "email" | "password");
    if !is_admin && !(is_self && self_editable) {
        conn.reply(NOT_AUTHORIZED, "not authorized to edit that user");
        return;
    }

    let new_rights = if key == "rights" {
        if !is_admin {
            conn.reply(NOT_AUTHORIZED, "not authorized to change rights");
            return;
        }
        match Rights::parse(value) {
            Ok(rights) => Some(rights.storable()),
            Err(e) => {
                conn.reply(NOT_FOUND, &e.to_string());
                return;
            }
        }
    } else {
        None
    };

    let updated = jb.store.borrow_mut().update_user(name, |record| {
        match key.as_str() {
            "email" => record.email = Some(value.clone()),
            "password" => record.password = value.clone(),
            "rights" => record.rights = new_rights.expect("parsed above").to_string(),
            _ => return false,
        }
        true
    });
    match updated {
        Ok(true) if matches!(key.as_str(), "email" | "password" | "rights") => {
            if let Some(rights) = new_rights {
                // Live connections learn their new rights immediately.
                jb.propagate_rights(name, rights);
            }
            jb.publish(&format!("user_edit {} {}", name, key));
            conn.reply(OK, "user updated");
        }
        Ok(true) => conn.reply(NOT_FOUND, &format!("unknown user property {:?}", key)),
        Ok(false) => conn.reply(NOT_FOUND, &format!("no such user {:?}", name)),
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn userinfo(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let (name, key) = (&args[0], &args[1]);
    let is_self = conn.user().as_deref() == Some(name.as_str());
    let self_readable = matches!(key.as_str(), "email" | "rights");
    let privileged = conn.rights().intersects(Rights::ADMIN | Rights::USERINFO);
    if !privileged && !(is_self && self_readable) {
        conn.reply(NOT_AUTHORIZED, "not authorized to read that user");
        return;
    }
    let store = jb.store.borrow();
    let Some(record) = store.user(name) else {
        conn.reply(NOT_FOUND, &format!("no such user {:?}", name));
        return;
    };
    let value = match key.as_str() {
        "email" => record.email.clone(),
        "rights" => Some(record.rights.clone()),
        "created" => Some(record.created.to_string()),
        _ => {
            conn.reply(NOT_FOUND, &format!("unknown user property {:?}", key));
            return;
        }
    };
    match value {
        Some(value) => conn.reply(VALUE, &value),
        None => conn.reply(NO_VALUE, "no value"),
    }
}

pub(super) fn users(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let store = jb.store.borrow();
    let names: Vec<String> = store.usernames().map(|s| s.to_string()).collect();
    conn.reply_body(BODY, "users follow", names);
}

/// Self-service registration: creates an unconfirmed account and mails the
/// confirmation token out (when a mailer is configured). The token is also
/// the response value so front-ends can relay it themselves.
pub(super) async fn register(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let (name, password, email) = (&args[0], &args[1], &args[2]);
    if !valid_username(name) {
        conn.reply(NOT_FOUND, &format!("invalid username {:?}", name));
        return;
    }
    let mut token_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut token_bytes);
    let token = hex::encode(token_bytes);

    let record = UserRecord {
        password: password.clone(),
        email: Some(email.clone()),
        rights: jb.config.borrow().default_rights.to_string(),
        confirmation: Some(token.clone()),
        revoked_at: None,
        created: unix_now(),
    };
    match jb.store.borrow_mut().create_user(name, record) {
        Ok(true) => {}
        Ok(false) => {
            conn.reply(NOT_FOUND, &format!("cannot register {:?}", name));
            return;
        }
        Err(e) => {
            conn.reply(NOT_FOUND, &e.to_string());
            return;
        }
    }
    info!(user = %name, "registration pending confirmation");
    jb.publish(&format!("user_add {}", name));

    let mail = {
        let config = jb.config.borrow();
        config
            .sendmail
            .clone()
            .zip(config.mail_sender.clone())
    };
    if let Some((sendmail, sender)) = mail {
        let message = format!(
            "From: {}\nTo: {}\nSubject: jukebox registration\n\n\
             Confirm your registration with:\n\n  confirm {}\n",
            sender, email, token
        );
        let argv = vec![sendmail.to_string_lossy().into_owned(), "-t".to_string()];
        match run_mailer("register-mail", &argv, &message).await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "confirmation mail failed"),
            Err(e) => warn!(error = %e, "confirmation mail failed"),
        }
    }
    conn.reply(VALUE, &token);
}

pub(super) fn confirm(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let token = &args[0];
    let name = jb
        .store
        .borrow()
        .user_by_confirmation(token)
        .map(|s| s.to_string());
    let Some(name) = name else {
        conn.reply(NOT_FOUND, "no such confirmation");
        return;
    };
    if let Err(e) = jb.store.borrow_mut().update_user(&name, |record| {
        record.confirmation = None;
        true
    }) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    info!(user = %name, "registration confirmed");
    jb.publish(&format!("user_confirm {}", name));

    // Confirmation doubles as login for this connection.
    if conn.user().is_none() {
        let rights = {
            let store = jb.store.borrow();
            store.user(&name).map(|r| r.rights()).unwrap_or_default()
        };
        let effective = if conn.shared.local {
            rights | Rights::LOCAL
        } else {
            rights
        };
        *conn.shared.user.borrow_mut() = Some(name.clone());
        conn.shared.rights.set(effective);
    }
    conn.reply(COOKIE_USER, &name);
}

/// Password reminder by mail, rate-limited per user.
pub(super) async fn reminder(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let name = &args[0];
    let mail = {
        let config = jb.config.borrow();
        config.sendmail.clone().zip(config.mail_sender.clone())
    };
    let Some((sendmail, sender)) = mail else {
        conn.reply(NOT_FOUND, "reminders are not configured");
        return;
    };

    let (password, email) = {
        let store = jb.store.borrow();
        match store.user(name) {
            Some(record) => match &record.email {
                Some(email) => (record.password.clone(), email.clone()),
                None => {
                    conn.reply(NOT_FOUND, "no email address on file");
                    return;
                }
            },
            None => {
                conn.reply(NOT_FOUND, &format!("no such user {:?}", name));
                return;
            }
        }
    };

    let now = unix_now();
    let interval = jb.config.borrow().reminder_interval.as_secs();
    {
        let reminders = jb.reminders.borrow();
        if reminders
            .get(name.as_str())
            .is_some_and(|last| now < last + interval)
        {
            conn.reply(NOT_FOUND, "reminder already sent recently");
            return;
        }
    }

    let message = format!(
        "From: {}\nTo: {}\nSubject: jukebox password reminder\n\n\
         Your password is: {}\n",
        sender, email, password
    );
    let argv = vec![sendmail.to_string_lossy().into_owned(), "-t".to_string()];
    match run_mailer("reminder-mail", &argv, &message).await {
        Ok(status) if status.success() => {
            jb.reminders.borrow_mut().insert(name.clone(), now);
            info!(user = %name, "password reminder sent");
            conn.reply(OK, "reminder sent");
        }
        Ok(status) => {
            warn!(%status, "reminder mail failed");
            conn.reply(NOT_FOUND, "could not send reminder");
        }
        Err(e) => {
            warn!(error = %e, "reminder mail failed");
            conn.reply(NOT_FOUND, "could not send reminder");
        }
    }
}

pub(super) fn make_cookie(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let rights = {
        let store = jb.store.borrow();
        match store.user(&user) {
            Some(record) => record.rights.clone(),
            None => {
                conn.reply(NOT_FOUND, "user record vanished");
                return;
            }
        }
    };
    let cookie = jb.cookies.borrow_mut().make(unix_now(), &user, &rights);
    conn.reply(VALUE, &cookie);
}

/// Invalidate every cookie previously issued to the calling user.
pub(super) fn revoke(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let now = unix_now();
    match jb.store.borrow_mut().update_user(&user, |record| {
        record.revoked_at = Some(now);
        true
    }) {
        Ok(true) => {
            jb.publish(&format!("user_edit {} revoke", user));
            conn.reply(OK, "cookies revoked");
        }
        Ok(false) => conn.reply(NOT_FOUND, "user record vanished"),
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

/// Cookie login lives here next to its friends; dispatched as `cookie`.
pub(super) fn login_cookie(jb: &Rc<Jukebox>, conn: &mut Connection, cookie: &str) {
    if conn.user().is_some() {
        conn.reply(AUTH_FAILED, "already authenticated");
        return;
    }
    let Some(name) = cookies::parse_user(cookie) else {
        conn.reply(AUTH_FAILED, "malformed cookie");
        return;
    };
    let (rights_string, rights, revoked_at, confirmed) = {
        let store = jb.store.borrow();
        match store.user(&name) {
            Some(record) => (
                record.rights.clone(),
                record.rights(),
                record.revoked_at,
                record.is_confirmed(),
            ),
            None => {
                conn.reply(AUTH_FAILED, "authentication failed");
                return;
            }
        }
    };
    if !confirmed {
        conn.reply(AUTH_FAILED, "registration not confirmed");
        return;
    }
    let verdict =
        jb.cookies
            .borrow_mut()
            .verify(unix_now(), cookie, &rights_string, revoked_at);
    match verdict {
        Ok(user) if user == name => {
            let effective = if conn.shared.local {
                rights | Rights::LOCAL
            } else {
                rights
            };
            *conn.shared.user.borrow_mut() = Some(name.clone());
            conn.shared.rights.set(effective);
            info!(user = %name, "cookie login");
            conn.reply(COOKIE_USER, &name);
        }
        Ok(_) | Err(_) => {
            warn!(user = %name, "cookie rejected");
            conn.reply(AUTH_FAILED, "authentication failed");
        }
    }
}
