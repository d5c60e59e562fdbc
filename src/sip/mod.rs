mod dialog;
mod message;

pub use dialog::{Dialog, DialogFactory, DialogSetup, DialogStatus, TransactionRecord};
pub use message::{
    MessageBody, RAck, SipReply, SipRequest, TransactionTicket, allows_update, is_offer_answer,
};
