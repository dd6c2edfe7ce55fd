//! Stemcells are container images; nothing is uploaded

use tracing::info;

use crate::cpi::StemcellCloudProperties;
use crate::Result;

/// The stemcell CID is the image named in the cloud properties
pub fn create_stemcell(image_path: &str, cloud_props: &StemcellCloudProperties) -> Result<String> {
    info!(image = %cloud_props.image, image_path, "registering stemcell image");
    Ok(cloud_props.image.clone())
}

/// Images are never deleted from the registry
pub fn delete_stemcell(_stemcell_cid: &str) -> Result<()> {
    Ok(())
}
