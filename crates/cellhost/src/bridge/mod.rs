//! Wire layer between processes of a host tree.
//!
//! - **protocol**: value model and the fixed-size supervisor records
//! - **codec**: NaN-boxed `ContainerMessage` encoding with descriptor accounting
//! - **transport**: SEQPACKET sockets, SCM_RIGHTS and [`MailboxAddress`](transport::MailboxAddress)

pub mod codec;
pub mod protocol;
pub mod transport;
