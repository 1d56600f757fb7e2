pub mod jsonrpc;

mod capabilities;
mod completions;
mod content;
mod elicitation;
mod implementation;
mod initialization;
mod logging;
mod notifications;
mod prompts;
mod resources;
mod roots;
mod sampling;
mod tools;

pub use capabilities::*;
pub use completions::*;
pub use content::*;
pub use elicitation::*;
pub use implementation::*;
pub use initialization::*;
pub use jsonrpc::*;
pub use logging::*;
pub use notifications::*;
pub use prompts::*;
pub use resources::*;
pub use roots::*;
pub use sampling::*;
pub use tools::*;
