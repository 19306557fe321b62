mod device;
mod measure;
mod metric;
mod oid;
mod request;

pub use device::{sec_level, snmp_version, Device, Profile, SnmpParams};
pub use measure::{IndexedMeasure, ScalarMeasure};
pub use metric::{group_by_oid, names, Metric};
pub use oid::Oid;
pub use request::{
    device_id_of, request_uid, OngoingPolls, PingHost, PingRequest, SnmpRequest, CHECK_URI,
    ONGOING_URI, PING_JOB_URI, REPORT_URI, SNMP_JOB_URI,
};
