//! Cloud-provider detection and metadata probing.
//!
//! The BIOS vendor string picks the hypervisor; the cloud follows from it
//! (and from DHCP option 245 for Azure). Each known provider has a small
//! request table for the metadata endpoint. Every probe is best-effort:
//! env vars keep their internal fallbacks when an endpoint is
//! unreachable.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use vinitd_shared::VinitdResult;

use super::vmtools;

use crate::instance::{
    env_ext_ip, env_ip, Cloud, Hypervisor, Vinitd, ENV_CLOUD_PROVIDER, ENV_ETH_COUNT,
    ENV_EXT_HOSTNAME, ENV_HOSTNAME, ENV_HYPERVISOR, ENV_INSTANCE_ID, ENV_USERDATA,
};

const METADATA_URL: &str = "http://169.254.169.254";
const AZURE_WIRE_SERVER: &str = "168.63.129.16";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request shapes for one provider's metadata service. `interface_url`
/// takes the interface index on providers that expose one entry per NIC.
struct CloudReq {
    interface_url: fn(usize) -> String,
    custom_data_url: &'static str,
    hostname_url: Option<&'static str>,
    headers: &'static [(&'static str, &'static str)],
    query: &'static [(&'static str, &'static str)],
}

static AZURE_REQ: CloudReq = CloudReq {
    interface_url: |n| {
        format!(
            "{}/metadata/instance/network/interface/{}/ipv4/ipAddress/0/publicIpAddress",
            METADATA_URL, n
        )
    },
    custom_data_url: "/metadata/instance/compute/customData",
    hostname_url: None,
    headers: &[("Metadata", "True"), ("Host", "metadata.azure.internal")],
    query: &[("format", "text"), ("api-version", "2019-02-01")],
};

static GCP_REQ: CloudReq = CloudReq {
    interface_url: |n| {
        format!(
            "{}/computeMetadata/v1/instance/network-interfaces/{}/access-configs/0/external-ip",
            METADATA_URL, n
        )
    },
    custom_data_url: "/computeMetadata/v1/instance/attributes/vorteil",
    hostname_url: Some("/computeMetadata/v1/instance/hostname"),
    headers: &[
        ("Host", "metadata.google.internal"),
        ("Metadata-Flavor", "Google"),
    ],
    query: &[],
};

static EC2_REQ: CloudReq = CloudReq {
    interface_url: |_| format!("{}/latest/meta-data/public-ipv4", METADATA_URL),
    custom_data_url: "/latest/user-data",
    hostname_url: Some("/latest/meta-data/public-hostname"),
    headers: &[("Host", "metadata.ec2.internal"), ("Metadata", "true")],
    query: &[],
};

const EC2_INSTANCE_ID_URL: &str = "/latest/meta-data/instance-id";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .unwrap_or_default()
}

async fn metadata_request(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, &str)],
    query: &[(&str, &str)],
) -> VinitdResult<String> {
    let mut req = client.get(url);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    if !query.is_empty() {
        req = req.query(query);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| vinitd_shared::VinitdError::Network(format!("metadata {}: {}", url, e)))?;

    if resp.status().as_u16() != 200 {
        return Err(vinitd_shared::VinitdError::Network(
            "metadata not found".into(),
        ));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| vinitd_shared::VinitdError::Network(format!("metadata body: {}", e)))?;

    Ok(body.trim().to_string())
}

/// Whether the hypervisor UUID marks an EC2 instance (Xen on EC2).
pub fn uuid_is_ec2(uuid: &str) -> bool {
    uuid.trim().starts_with("ec2")
}

fn sys_hypervisor_uuid() -> String {
    std::fs::read_to_string("/sys/hypervisor/uuid").unwrap_or_default()
}

/// Map the BIOS vendor string to hypervisor and cloud. `dhcp_azure`
/// carries the DHCP option 245 verdict for the Hyper-V case.
pub fn hypervisor_guess(bios: &str, dhcp_azure: bool, xen_uuid_ec2: bool) -> (Hypervisor, Cloud) {
    if bios.starts_with("SeaBIOS") {
        (Hypervisor::Kvm, Cloud::None)
    } else if bios.starts_with("innotek GmbH") {
        (Hypervisor::Virtualbox, Cloud::None)
    } else if bios.starts_with("Phoenix Technologies LTD") {
        (Hypervisor::Vmware, Cloud::None)
    } else if bios.starts_with("Google") {
        (Hypervisor::Kvm, Cloud::Gcp)
    } else if bios.starts_with("Amazon") {
        (Hypervisor::Kvm, Cloud::Ec2)
    } else if bios.starts_with("Xen") {
        if xen_uuid_ec2 {
            (Hypervisor::Xen, Cloud::Ec2)
        } else {
            (Hypervisor::Xen, Cloud::None)
        }
    } else if bios.starts_with("American Megatrends Inc.") {
        // the cloud value has been set by DHCP already, option 245
        let cp = if dhcp_azure { Cloud::Azure } else { Cloud::None };
        (Hypervisor::Hyperv, cp)
    } else {
        (Hypervisor::Unknown, Cloud::Unknown)
    }
}

/// Baseline environment exposed to programs. External values default to
/// their internal counterparts so they are never empty.
pub fn basic_env(v: &Arc<Vinitd>) {
    let (hv, cloud) = {
        let info = v.hypervisor_info.lock();
        (info.hypervisor, info.cloud)
    };

    v.set_env(ENV_HYPERVISOR, hv.as_str());
    v.set_env(ENV_CLOUD_PROVIDER, cloud.as_str());
    v.set_env(ENV_ETH_COUNT, &v.eth_count().to_string());

    let hostname = v.hostname.read().clone();
    v.set_env(ENV_HOSTNAME, &hostname);
    v.set_env(ENV_EXT_HOSTNAME, &hostname);
    v.set_env(ENV_USERDATA, "");

    let ifcs = v.ifcs.lock().clone();
    for ifc in &ifcs {
        if let Some(ip) = ifc.addr {
            v.set_env(&env_ip(ifc.idx), &ip.to_string());
            v.set_env(&env_ext_ip(ifc.idx), &ip.to_string());
        }
    }
}

async fn probe(req: &CloudReq, v: &Arc<Vinitd>, ec2: bool) {
    let client = http_client();

    let ifcs = v.ifcs.lock().clone();
    for ifc in &ifcs {
        let url = (req.interface_url)(ifc.idx);
        tracing::debug!("probe ip url {}", url);

        match metadata_request(&client, &url, req.headers, req.query).await {
            Ok(r) => {
                tracing::debug!("setting metadata {} to {}", env_ext_ip(ifc.idx), r);
                v.set_env(&env_ext_ip(ifc.idx), &r);
            }
            Err(e) => {
                tracing::warn!("error requesting metadata: {}", e);
                continue;
            }
        }

        // ec2 exposes a single public address
        if ec2 {
            break;
        }
    }

    let url = format!("{}{}", METADATA_URL, req.custom_data_url);
    tracing::debug!("probe custom url {}", url);
    match metadata_request(&client, &url, req.headers, req.query).await {
        Ok(userdata) => v.set_env(ENV_USERDATA, &userdata),
        Err(e) => tracing::debug!("error requesting metadata userdata: {}", e),
    }

    if let Some(hostname_url) = req.hostname_url {
        let url = format!("{}{}", METADATA_URL, hostname_url);
        tracing::debug!("probe hostname url {}", url);
        match metadata_request(&client, &url, req.headers, req.query).await {
            Ok(hn) => v.set_env(ENV_EXT_HOSTNAME, &hn),
            Err(e) => tracing::debug!("error requesting metadata hostname: {}", e),
        }
    }

    if ec2 {
        let url = format!("{}{}", METADATA_URL, EC2_INSTANCE_ID_URL);
        match metadata_request(&client, &url, req.headers, req.query).await {
            Ok(iid) => v.set_env(ENV_INSTANCE_ID, &iid),
            Err(e) => tracing::debug!("error requesting instance id: {}", e),
        }
    }
}

/// Pull container and instance ids out of the wire-server goalstate.
pub fn parse_goalstate(xml: &str) -> Option<(String, String)> {
    let container = Regex::new(r"<ContainerId>([^<]*)</ContainerId>").ok()?;
    let instance = Regex::new(r"<InstanceId>([^<]*)</InstanceId>").ok()?;

    let cid = container.captures(xml)?.get(1)?.as_str().to_string();
    let iid = instance.captures(xml)?.get(1)?.as_str().to_string();
    Some((cid, iid))
}

/// Health report posted back to the wire server.
pub fn health_xml(cid: &str, iid: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><Health xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\"><GoalStateIncarnation>1</GoalStateIncarnation><Container><ContainerId>{}</ContainerId><RoleInstanceList><Role><InstanceId>{}</InstanceId><Health><State>Ready</State></Health></Role></RoleInstanceList></Container></Health>",
        cid, iid
    )
}

/// The wire server only marks the VM healthy after a goalstate/health
/// handshake; without it Azure recycles the instance.
async fn update_health_azure() {
    tracing::debug!("update azure health");

    let client = http_client();
    let url = format!("http://{}/machine/", AZURE_WIRE_SERVER);

    let resp = client
        .get(&url)
        .header("x-ms-agent-name", "WALinuxAgent")
        .header("x-ms-version", "2012-11-30")
        .query(&[("comp", "goalstate")])
        .send()
        .await;

    let body = match resp {
        Ok(r) if r.status().as_u16() == 200 => r.text().await.unwrap_or_default(),
        Ok(r) => {
            tracing::error!("error updating machine status: http {}", r.status());
            return;
        }
        Err(e) => {
            tracing::error!("error updating machine status: {}", e);
            return;
        }
    };

    let Some((cid, iid)) = parse_goalstate(&body) else {
        tracing::error!("can not report VM as healthy, missing goalstate ids");
        return;
    };

    let xml = health_xml(&cid, &iid);
    let resp = client
        .post(&url)
        .header("Content-Type", "text/xml;charset=utf-8")
        .header("x-ms-agent-name", "WALinuxAgent")
        .header("x-ms-version", "2012-11-30")
        .query(&[("comp", "health")])
        .body(xml)
        .send()
        .await;

    match resp {
        Ok(r) if r.status().as_u16() == 200 => {}
        Ok(_) | Err(_) => tracing::error!("can not report VM as healthy, final post failed"),
    }
}

/// Detect the platform from the BIOS vendor and fill the cloud env vars.
/// A missing DMI tree means Firecracker, which has neither BIOS string
/// nor metadata service.
pub async fn detect_cloud(v: &Arc<Vinitd>) {
    let bios = match std::fs::read_to_string("/sys/devices/virtual/dmi/id/bios_vendor") {
        Ok(b) => b,
        Err(_) => {
            tracing::warn!("can not read bios vendor");
            v.is_firecracker.store(true, std::sync::atomic::Ordering::SeqCst);
            {
                let mut info = v.hypervisor_info.lock();
                info.hypervisor = Hypervisor::Unknown;
                info.cloud = Cloud::Unknown;
            }
            basic_env(v);
            return;
        }
    };

    tracing::debug!("guessing hypervisor: {}", bios.trim());

    let dhcp_azure = v.hypervisor_info.lock().cloud == Cloud::Azure;
    let (hv, cloud) = hypervisor_guess(&bios, dhcp_azure, uuid_is_ec2(&sys_hypervisor_uuid()));

    if hv == Hypervisor::Vmware {
        let cards = v.eth_count();
        let hostname = v.hostname.read().clone();
        vmtools::start_vmtools(cards, &hostname);
    }

    {
        let mut info = v.hypervisor_info.lock();
        info.hypervisor = hv;
        info.cloud = cloud;
    }

    fetch_cloud_metadata(v).await;
}

pub async fn fetch_cloud_metadata(v: &Arc<Vinitd>) {
    basic_env(v);

    let cloud = v.hypervisor_info.lock().cloud;
    tracing::debug!(
        "cloud values: {} {}",
        v.hypervisor_info.lock().hypervisor.as_str(),
        cloud.as_str()
    );

    match cloud {
        Cloud::Azure => {
            update_health_azure().await;
            probe(&AZURE_REQ, v, false).await;
        }
        Cloud::Gcp => probe(&GCP_REQ, v, false).await,
        Cloud::Ec2 => probe(&EC2_REQ, v, true).await,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypervisor_guess_table() {
        let cases = [
            ("SeaBIOS 1.14", Hypervisor::Kvm, Cloud::None),
            ("innotek GmbH VirtualBox", Hypervisor::Virtualbox, Cloud::None),
            ("Phoenix Technologies LTD 6.0", Hypervisor::Vmware, Cloud::None),
            ("Google Compute Engine", Hypervisor::Kvm, Cloud::Gcp),
            ("Amazon EC2", Hypervisor::Kvm, Cloud::Ec2),
            ("something else", Hypervisor::Unknown, Cloud::Unknown),
        ];
        for (bios, hv, cloud) in cases {
            assert_eq!(hypervisor_guess(bios, false, false), (hv, cloud));
        }
    }

    #[test]
    fn test_hypervisor_guess_xen() {
        assert_eq!(
            hypervisor_guess("Xen 4.2", false, true),
            (Hypervisor::Xen, Cloud::Ec2)
        );
        assert_eq!(
            hypervisor_guess("Xen 4.2", false, false),
            (Hypervisor::Xen, Cloud::None)
        );
    }

    #[test]
    fn test_hypervisor_guess_hyperv_keeps_dhcp_cloud() {
        assert_eq!(
            hypervisor_guess("American Megatrends Inc.", true, false),
            (Hypervisor::Hyperv, Cloud::Azure)
        );
        assert_eq!(
            hypervisor_guess("American Megatrends Inc.", false, false),
            (Hypervisor::Hyperv, Cloud::None)
        );
    }

    #[test]
    fn test_uuid_is_ec2() {
        assert!(uuid_is_ec2("ec2e1916-9099-7caf-fd21-012345abcdef"));
        assert!(uuid_is_ec2("ec2e1916\n"));
        assert!(!uuid_is_ec2("4c4c4544-0042-3110-8046-b2c04f4d3732"));
        assert!(!uuid_is_ec2(""));
    }

    #[test]
    fn test_parse_goalstate() {
        let xml = "<GoalState><Container><ContainerId>abc-123</ContainerId></Container>\
                   <RoleInstance><InstanceId>vm-0</InstanceId></RoleInstance></GoalState>";
        let (cid, iid) = parse_goalstate(xml).unwrap();
        assert_eq!(cid, "abc-123");
        assert_eq!(iid, "vm-0");

        assert!(parse_goalstate("<GoalState></GoalState>").is_none());
    }

    #[test]
    fn test_health_xml_contains_ids() {
        let xml = health_xml("cid-1", "iid-2");
        assert!(xml.contains("<ContainerId>cid-1</ContainerId>"));
        assert!(xml.contains("<InstanceId>iid-2</InstanceId>"));
        assert!(xml.contains("<State>Ready</State>"));
    }

    #[test]
    fn test_interface_urls() {
        assert!((GCP_REQ.interface_url)(1).contains("network-interfaces/1/"));
        assert!((AZURE_REQ.interface_url)(2).contains("interface/2/"));
        // ec2 ignores the index
        assert_eq!((EC2_REQ.interface_url)(0), (EC2_REQ.interface_url)(5));
    }
}
