pub mod echo;
pub mod human;
pub mod scripted;

pub use echo::EchoHandler;
pub use human::{ChannelHumanHandler, HumanReply};
pub use scripted::ScriptedHandler;
