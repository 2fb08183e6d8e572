//! Hemera core: patterns, subject matching, the cross-hop error model, codec
//! pipelines and wire packets.

pub mod codec;
pub mod context;
pub mod errio;
pub mod error;
pub mod packet;
pub mod pattern;
pub mod schema;
pub mod subject;
pub mod trace;

pub use codec::{CodecPipeline, CodecStep, Frame, JsonCodec, MsgPackCodec};
pub use context::CallContext;
pub use errio::{ErrioConfig, ErrorClass, ErrorRegistry};
pub use error::{ErrorKind, HemeraError, Hop};
pub use packet::{Packet, RequestInfo, RequestKind};
pub use pattern::{Pattern, PatternError};
pub use schema::{FieldDef, FieldKind, PayloadSchema, ValidationResult};
pub use subject::{Subject, SubjectError};
pub use trace::Trace;
