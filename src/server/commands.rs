mod cancel;
mod complete;
mod dispatch;
mod heartbeat;
mod output;
mod submit;

pub use cancel::*;
pub use complete::*;
pub use dispatch::*;
pub use heartbeat::*;
pub use output::*;
pub use submit::*;
