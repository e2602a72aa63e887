pub use cairn_error::{HalError, HalResult};
