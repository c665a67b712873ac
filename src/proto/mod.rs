//! Protocol implementations. Only HTTP/1.1 is implemented; see the crate's
//! Non-goals for HTTP/2 and HTTP/3.

pub(crate) mod h1;
