//! Core SMTP types.

mod extension;
mod options;
mod reply;
mod status;

pub use extension::Extensions;
pub use options::{
    BodyType, DsnAddressType, DsnNotify, DsnReturn, MailOptions, RcptOptions, SendOptions,
    Utf8Mode, VerifyOptions, VrfyOptions,
};
pub use reply::{Reply, ReplyCode};
pub use status::{EnhancedCode, Status};
