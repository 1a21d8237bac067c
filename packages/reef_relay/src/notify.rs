//! Registration notification seam.
//!
//! Delivery (SMTP, templating) belongs to an external collaborator; the
//! relay only decides *when* a notification is owed.

use tracing::info;

use crate::models::User;

pub trait Notifier: Send {
    /// Called once per successful registration.
    fn welcome(&self, user: &User);
}

/// Default notifier: records the event in the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn welcome(&self, user: &User) {
        info!(
            user = %user.display_name(),
            email = user.email.as_deref().unwrap_or("-"),
            "welcome notification queued"
        );
    }
}
