//! Request validation. Every violated rule is reported, not just the first.

use std::fmt;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::clock::Clock;
use crate::limits::{MAX_HORIZON_DAYS_CAP, MAX_STAY_NIGHTS_CAP};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: &'static str,
    pub rule: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, field: &'static str, rule: &'static str, value: impl fmt::Display) {
        self.violations.push(FieldViolation {
            field,
            rule,
            value: value.to_string(),
        });
    }

    pub fn has(&self, field: &str, rule: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.field == field && v.rule == rule)
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {} ({})", v.field, v.rule, v.value)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validation component handed to the engine at construction.
#[derive(Clone)]
pub struct Validator {
    max_stay_nights: u32,
    horizon_days: u32,
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(max_stay_nights: u32, horizon_days: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_stay_nights: max_stay_nights.clamp(1, MAX_STAY_NIGHTS_CAP),
            horizon_days: horizon_days.min(MAX_HORIZON_DAYS_CAP),
            clock,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn max_stay_nights(&self) -> u32 {
        self.max_stay_nights
    }

    fn check_range(&self, range: &DateRange, errors: &mut ValidationErrors) {
        let today = self.today();
        if !range.is_well_formed() {
            errors.push("check_out", "after_check_in", range.check_out);
        } else if range.nights() > i64::from(self.max_stay_nights) {
            errors.push("check_out", "max_stay", range.nights());
        }
        if range.check_in < today {
            errors.push("check_in", "not_in_past", range.check_in);
        }
        let horizon = today.checked_add_days(Days::new(u64::from(self.horizon_days)));
        if horizon.is_none_or(|h| range.check_in > h) {
            errors.push("check_in", "within_horizon", range.check_in);
        }
    }

    fn check_payment(&self, payment: &PaymentRequest, errors: &mut ValidationErrors) {
        if payment.amount == 0 {
            errors.push("amount", "positive", payment.amount);
        }
        if payment.paid_on > self.today() {
            errors.push("paid_on", "not_in_future", payment.paid_on);
        }
    }

    pub fn validate_range(&self, range: &DateRange) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        self.check_range(range, &mut errors);
        errors.into_result()
    }

    pub fn validate_payment(&self, payment: &PaymentRequest) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        self.check_payment(payment, &mut errors);
        errors.into_result()
    }

    /// Range and payment together, so a client sees every problem in one round trip.
    pub fn validate_booking(
        &self,
        request: &BookingRequest,
        payment: Option<&PaymentRequest>,
    ) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        self.check_range(&request.range, &mut errors);
        if let Some(p) = payment {
            self.check_payment(p, &mut errors);
        }
        errors.into_result()
    }

    pub fn validate_patch(&self, patch: &ReceiptPatch) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if patch.amount == Some(0) {
            errors.push("amount", "positive", 0);
        }
        if let Some(paid_on) = patch.paid_on
            && paid_on > self.today()
        {
            errors.push("paid_on", "not_in_future", paid_on);
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::date;
    use ulid::Ulid;

    fn validator() -> Validator {
        Validator::new(14, 365, Arc::new(FixedClock::on(date(2025, 2, 1))))
    }

    fn request(check_in: NaiveDate, check_out: NaiveDate) -> BookingRequest {
        BookingRequest {
            room_id: RoomId(101),
            guest_id: Ulid::new(),
            range: DateRange::new(check_in, check_out),
        }
    }

    #[test]
    fn valid_range_passes() {
        let v = validator();
        assert!(v.validate_range(&DateRange::new(date(2025, 3, 1), date(2025, 3, 4))).is_ok());
        // check-in today is allowed
        assert!(v.validate_range(&DateRange::new(date(2025, 2, 1), date(2025, 2, 2))).is_ok());
    }

    #[test]
    fn checkout_must_follow_checkin() {
        let v = validator();
        let err = v
            .validate_range(&DateRange::new(date(2025, 3, 4), date(2025, 3, 4)))
            .unwrap_err();
        assert!(err.has("check_out", "after_check_in"));
        assert_eq!(err.violations.len(), 1);
    }

    #[test]
    fn stay_longer_than_max_rejected() {
        let v = validator();
        let err = v
            .validate_range(&DateRange::new(date(2025, 3, 1), date(2025, 3, 16)))
            .unwrap_err();
        assert!(err.has("check_out", "max_stay"));
        assert!(v.validate_range(&DateRange::new(date(2025, 3, 1), date(2025, 3, 15))).is_ok());
    }

    #[test]
    fn past_and_beyond_horizon_rejected() {
        let v = validator();
        let past = v
            .validate_range(&DateRange::new(date(2025, 1, 30), date(2025, 2, 2)))
            .unwrap_err();
        assert!(past.has("check_in", "not_in_past"));

        let far = v
            .validate_range(&DateRange::new(date(2026, 3, 1), date(2026, 3, 2)))
            .unwrap_err();
        assert!(far.has("check_in", "within_horizon"));
    }

    #[test]
    fn every_violation_is_listed() {
        let v = validator();
        let req = request(date(2025, 1, 10), date(2025, 1, 5));
        let payment = PaymentRequest {
            amount: 0,
            method: PaymentMethod::Cash,
            paid_on: date(2025, 2, 2),
        };
        let err = v.validate_booking(&req, Some(&payment)).unwrap_err();
        assert!(err.has("check_out", "after_check_in"));
        assert!(err.has("check_in", "not_in_past"));
        assert!(err.has("amount", "positive"));
        assert!(err.has("paid_on", "not_in_future"));
        assert_eq!(err.violations.len(), 4);
        let msg = err.to_string();
        assert!(msg.contains("check_in: not_in_past (2025-01-10)"), "{msg}");
    }

    #[test]
    fn patch_validation() {
        let v = validator();
        assert!(v.validate_patch(&ReceiptPatch::default()).is_ok());
        let err = v
            .validate_patch(&ReceiptPatch {
                amount: Some(0),
                method: None,
                paid_on: Some(date(2025, 3, 1)),
            })
            .unwrap_err();
        assert_eq!(err.violations.len(), 2);
    }

    #[test]
    fn configured_limits_are_clamped() {
        let v = Validator::new(0, 10_000, Arc::new(FixedClock::on(date(2025, 2, 1))));
        assert_eq!(v.max_stay_nights(), 1);
        assert!(v.horizon_days <= MAX_HORIZON_DAYS_CAP);
    }
}
