mod delegate;
mod proxy;

pub use delegate::{
    ClaimCallback, ClientCallback, ClientHandle, ClientListCallback, ClientType, ClientsDelegate,
    MatchAllOptions, NullClients, VisibilityState, WindowClientHandle,
};
pub use proxy::{Client, ClientRegistry};
