//! TCP network surface: four independent listeners fanning the bus in and
//! out to concurrently connected clients.
//!
//! # Architecture
//!
//! ```text
//! Bus task                              Network task(s)
//! ┌──────────────────┐                 ┌────────────────────────┐
//! │ Bus               │  BusCommand    │ raw_conn / client_conn  │
//! │  observer          │◄───────────────│  one task per connection│
//! │  arbitration       │  FanoutSender  │                         │
//! │  claim             │───────────────►│  FanoutReceiver         │
//! └────────┬───────────┘                └────────┬────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//!   tokio-serial port                        TcpListener × 4
//! ```
//!
//! Ports: raw read/write (3333), raw read-only (3334), enhanced (3335),
//! status (5555). See [`enhanced`] for the tagged wire protocol and
//! [`fanout`] for the client event queue shared by all of them.

pub mod client_conn;
pub mod enhanced;
pub mod fanout;
pub mod raw_conn;
pub mod server;
