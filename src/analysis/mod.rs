pub mod call_graph;
pub mod dom;
pub mod live;
pub mod nlf;
pub mod phi_web;
pub mod scc;
pub mod uses;
