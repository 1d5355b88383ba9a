//! The ambient, read-only references every engine handler needs: network parameters, the
//! certification registry, and the uuid uniqueness source (§9 design notes bundle these instead
//! of threading three separate parameters through every call).

use crate::certification::CertificationRegistry;
use crate::instance_id::InstanceIdSource;
use crate::network_info::NetworkInfo;

#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub net: &'a NetworkInfo,
    pub registry: &'a CertificationRegistry,
    pub source: &'a dyn InstanceIdSource,
}
