//! Weft Delta - per-channel views of the ordered document stream
//!
//! The container sees one monotonically increasing document sequence number.
//! A channel only ever sees its own local numbering, which starts at zero at
//! the point the channel became known to the system (its attach message was
//! sequenced), regardless of how old the document is.
//!
//! ## Key Concepts
//!
//! - **Base mapping**: the `(local, document)` pair at which the channel's
//!   numbering is anchored. Set exactly once.
//! - **Translation**: `local = base.local + (document - base.document)`,
//!   floored at `base.local` for history before the anchor.
//! - **Minimum sequence number**: the low-water mark all clients have
//!   acknowledged; only ever advances.
//!
//! ```text
//! document: ... 40 41 42 [43 = attach echo] 44 45 46
//! local:         0  0  0   0                 1  2  3
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_delta::{BaseMapping, DeltaConnection};
//!
//! let connection = DeltaConnection::new("counter-1", state, submit);
//! connection.set_base_mapping(BaseMapping::attach(43), 40)?;
//! connection.process(&*channel, &message, false)?;
//! ```

pub mod connection;

pub use connection::{BaseMapping, DeltaConnection, DeltaError, DeltaHandler, SubmitFn};
