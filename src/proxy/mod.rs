// Proxy module - the transparent capture proxy
//
// An axum server intercepts client traffic, forwards it to the classified
// upstream unchanged, and tees responses through per-provider parsers into
// the interaction store. Admin endpoints under /_interceptor/ expose the
// captured data; everything else is proxied.

mod api;
mod error;
mod handler;
mod server;
mod session;
mod state;
mod tee;

pub use server::start_proxy;
