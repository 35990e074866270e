pub mod admin;
pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod datagram;
pub mod domains;
pub mod httpd;
pub mod inspect;
pub mod limits;
pub mod logging;
pub mod net;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tcpproxy;
pub mod telemetry;
pub mod transport;
pub mod udpproxy;
