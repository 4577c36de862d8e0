pub mod m_p2p;
pub mod m_p2p_chan;
pub mod msg_pack;
pub mod msgs;
