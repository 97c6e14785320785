//! End-to-end tests: file transfers over live channels.

#[cfg(test)]
mod channel_e2e;

#[cfg(test)]
mod transfer_e2e;
