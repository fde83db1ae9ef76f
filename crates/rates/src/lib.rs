//! `marketpay-rates` — commission and VAT rate rule sets.
//!
//! Both resolvers share the same structure: a per-tenant schedule aggregate
//! holding scoped, time-bounded rules. Overlapping active rules of the same
//! scope are rejected at write time, so resolution never has to break ties.
//! Resolution walks an explicit precedence order, most specific scope first.

pub mod commission;
pub mod vat;
pub mod window;

pub use commission::{
    CommissionCommand, CommissionEvent, CommissionRule, CommissionSchedule, CommissionScheduleId,
    CommissionScope,
};
pub use vat::{CountryCode, VatCommand, VatEvent, VatRule, VatSchedule, VatScheduleId, VatScope};
pub use window::EffectiveWindow;
