pub mod eval;
pub mod m_dist_compute;
pub mod plan;
pub mod reduce;
