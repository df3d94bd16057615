//! User-facing copy for status transitions
//!
//! A static rule table maps `(old status, new status, context flags)` to a
//! title, a body and the participants who should receive it. The first
//! matching rule wins.

use serde::{Deserialize, Serialize};

use self::Recipient::{Both, Provider, Requester};
use crate::models::ServiceStatus;
use crate::models::ServiceStatus as S;
use crate::money::format_minor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Requester,
    Provider,
    Both,
}

/// Facts about the write that produced the transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub payment_released: bool,
    pub refunded: bool,
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
    pub recipient: Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    PaymentReleased,
    Refunded,
}

struct Rule {
    from: Option<ServiceStatus>,
    to: ServiceStatus,
    requires: Option<Flag>,
    title: &'static str,
    body: &'static str,
    recipient: Recipient,
}

const fn rule(
    from: Option<ServiceStatus>,
    to: ServiceStatus,
    requires: Option<Flag>,
    title: &'static str,
    body: &'static str,
    recipient: Recipient,
) -> Rule {
    Rule {
        from,
        to,
        requires,
        title,
        body,
        recipient,
    }
}

static RULES: &[Rule] = &[
    rule(
        Some(S::Scheduled),
        S::PendingUserConfirmation,
        None,
        "Confirm your booking",
        "Your provider proposed the service details. Please review and confirm.",
        Requester,
    ),
    rule(
        None,
        S::ConfirmedByProvider,
        None,
        "Booking confirmed",
        "Your provider confirmed the service request.",
        Requester,
    ),
    rule(
        None,
        S::Paid,
        None,
        "Payment received",
        "Payment of {amount} is held safely until the service is completed.",
        Both,
    ),
    rule(
        None,
        S::ProviderEnRoute,
        None,
        "Provider on the way",
        "Your provider is heading to you.",
        Requester,
    ),
    rule(
        None,
        S::ServiceStarted,
        None,
        "Service started",
        "Your provider has started the service.",
        Requester,
    ),
    rule(
        None,
        S::CompletedByProvider,
        None,
        "Confirm completion",
        "Your provider marked the service as completed. Please confirm.",
        Requester,
    ),
    rule(
        None,
        S::CompletedByUser,
        None,
        "Service confirmed",
        "The customer confirmed the service was completed.",
        Provider,
    ),
    rule(
        None,
        S::InDispute,
        None,
        "Dispute opened",
        "A dispute was opened. Payment is frozen until it is resolved.",
        Both,
    ),
    rule(
        Some(S::InDispute),
        S::ClosedDisputeResolved,
        Some(Flag::Refunded),
        "Dispute resolved",
        "The dispute was resolved with a refund of {amount}.",
        Both,
    ),
    rule(
        Some(S::InDispute),
        S::ClosedDisputeResolved,
        Some(Flag::PaymentReleased),
        "Dispute resolved",
        "The dispute was resolved and {amount} was released to the provider.",
        Both,
    ),
    rule(
        Some(S::InDispute),
        S::ClosedDisputeResolved,
        None,
        "Dispute resolved",
        "The dispute on this service has been resolved.",
        Both,
    ),
    rule(
        None,
        S::ClosedAuto,
        Some(Flag::PaymentReleased),
        "Payment released",
        "The service closed and {amount} was released to you.",
        Provider,
    ),
    rule(
        None,
        S::ClosedWithRating,
        Some(Flag::PaymentReleased),
        "Payment released",
        "The customer rated the service and {amount} was released to you.",
        Provider,
    ),
    rule(
        None,
        S::ClosedWithRating,
        None,
        "New rating",
        "The customer left a rating for your service.",
        Provider,
    ),
    rule(
        None,
        S::ClosedAuto,
        None,
        "Service closed",
        "This service request was closed automatically.",
        Both,
    ),
    rule(
        None,
        S::CancelledByUser,
        Some(Flag::Refunded),
        "Booking cancelled",
        "The booking was cancelled and {amount} was refunded.",
        Both,
    ),
    rule(
        None,
        S::CancelledByUser,
        None,
        "Booking cancelled",
        "The customer cancelled the booking.",
        Provider,
    ),
    rule(
        None,
        S::CancelledByProvider,
        None,
        "Booking cancelled",
        "Your provider cancelled the booking.",
        Requester,
    ),
    rule(
        None,
        S::RejectedByProvider,
        None,
        "Booking declined",
        "The provider could not take this booking.",
        Requester,
    ),
    rule(
        None,
        S::CancelledByAdmin,
        None,
        "Booking cancelled",
        "Support cancelled this booking.",
        Both,
    ),
    rule(
        None,
        S::ClosedForcedAdmin,
        None,
        "Service closed",
        "Support closed this service request.",
        Both,
    ),
];

impl Rule {
    fn matches(&self, old: ServiceStatus, new: ServiceStatus, ctx: &TransitionContext) -> bool {
        if self.to != new || self.from.map_or(false, |from| from != old) {
            return false;
        }
        match self.requires {
            None => true,
            Some(Flag::PaymentReleased) => ctx.payment_released,
            Some(Flag::Refunded) => ctx.refunded,
        }
    }
}

/// Copy for a transition, or `None` when nobody needs to hear about it.
pub fn transition_notice(
    old: ServiceStatus,
    new: ServiceStatus,
    ctx: &TransitionContext,
) -> Option<Notice> {
    RULES
        .iter()
        .find(|rule| rule.matches(old, new, ctx))
        .map(|rule| {
            let amount = ctx.amount.map(format_minor).unwrap_or_default();
            Notice {
                title: rule.title.to_string(),
                body: rule.body.replace("{amount}", &amount),
                recipient: rule.recipient,
            }
        })
}
