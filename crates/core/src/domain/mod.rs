pub mod approver;
pub mod category;
pub mod identity;
pub mod payment_method;
pub mod request;
