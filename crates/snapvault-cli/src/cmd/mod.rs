pub(crate) mod keygen;
pub(crate) mod list;
pub(crate) mod receive;
pub(crate) mod send;
