/// Management plane (components C and G): fixed-size wire codec, server
/// acceptor/dispatch, and the client-side helpers `socks5ctl` uses.
pub mod client;
pub mod protocol;
pub mod server;
