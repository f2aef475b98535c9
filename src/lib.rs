//! A reliable-transport overlay: nodes connect over plain UDP, establish per-peer links with
//!  acknowledgement, retransmission signalling and congestion control, and route application
//!  messages across the resulting mesh. On top of the routed layer, datagram streams offer
//!  message-oriented delivery in several reliability and ordering disciplines.
//!
//! [router_endpoint::RouterEndpoint] is the entry point for running a node; the layers below
//!  it ([packet_protocol], [packet_link], [router], [routing_table], [datagram_stream]) are
//!  public for composition with custom transports.

pub mod config;
pub mod congestion;
pub mod datagram_stream;
pub mod labels;
pub mod packet_link;
pub mod packet_nub;
pub mod packet_protocol;
pub mod receive_mode;
pub mod router;
pub mod router_endpoint;
pub mod routing_table;
pub mod status;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
