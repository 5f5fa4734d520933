//! Top-level instance records.

use crate::acceleration::BottomLevelAccel;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Placement of a bottom-level structure inside a top-level one.
///
/// Only the BLAS device address is kept; the BLAS itself must outlive every
/// build of a top-level structure referencing it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelInstance {
    pub blas_address: vk::DeviceAddress,
    pub transform: Mat4,
    /// Visible to shaders as `gl_InstanceCustomIndexEXT`. Only the low 24 bits are kept.
    pub custom_index: u32,
    pub mask: u8,
    /// Only the low 24 bits are kept.
    pub sbt_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl AccelInstance {
    pub fn new(blas: &BottomLevelAccel) -> Self {
        Self::from_address(blas.device_address())
    }

    /// Instance of the BLAS at `blas_address` with identity transform and full mask.
    pub fn from_address(blas_address: vk::DeviceAddress) -> Self {
        Self {
            blas_address,
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_sbt_offset(mut self, sbt_offset: u32) -> Self {
        self.sbt_offset = sbt_offset;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Device layout of this instance.
    pub fn record(&self) -> InstanceRecord {
        let rows = self.transform.transpose().to_cols_array();
        let mut transform = [0.0; 12];
        transform.copy_from_slice(&rows[..12]);

        #[allow(clippy::cast_possible_truncation)]
        let flags = self.flags.as_raw() as u8;

        InstanceRecord {
            transform,
            custom_index_and_mask: pack_24_8(self.custom_index, self.mask),
            sbt_offset_and_flags: pack_24_8(self.sbt_offset, flags),
            blas_reference: self.blas_address,
        }
    }
}

/// `VkAccelerationStructureInstanceKHR` as stored in the instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world matrix.
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub blas_reference: u64,
}

impl InstanceRecord {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Records for every instance, in order.
pub fn serialize_instances(instances: &[AccelInstance]) -> Vec<InstanceRecord> {
    instances.iter().map(AccelInstance::record).collect()
}

const fn pack_24_8(low: u32, high: u8) -> u32 {
    (low & 0x00FF_FFFF) | ((high as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};

    #[test]
    fn record_matches_vulkan_layout() {
        assert_eq!(InstanceRecord::SIZE, 64);
        assert_eq!(
            InstanceRecord::SIZE,
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
        assert_eq!(std::mem::align_of::<InstanceRecord>(), 8);
    }

    #[test]
    fn transform_is_row_major() {
        let record = AccelInstance::from_address(0x1000)
            .with_transform(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)))
            .record();

        #[rustfmt::skip]
        let expected = [
            1.0, 0.0, 0.0, 1.0,
            0.0, 1.0, 0.0, 2.0,
            0.0, 0.0, 1.0, 3.0,
        ];
        for (actual, expected) in record.transform.iter().zip(expected) {
            assert_relative_eq!(*actual, expected);
        }
    }

    #[test]
    fn packed_fields_match_ash() {
        let record = AccelInstance::from_address(0xABCD_0000)
            .with_custom_index(0x12_3456)
            .with_mask(0x0F)
            .with_sbt_offset(7)
            .record();

        let index_mask = vk::Packed24_8::new(0x12_3456, 0x0F);
        assert_eq!(record.custom_index_and_mask & 0x00FF_FFFF, index_mask.low_24());
        assert_eq!((record.custom_index_and_mask >> 24) as u8, index_mask.high_8());

        #[allow(clippy::cast_possible_truncation)]
        let cull_disable = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8;
        assert_eq!(record.sbt_offset_and_flags, 7 | (u32::from(cull_disable) << 24));
        assert_eq!(record.blas_reference, 0xABCD_0000);
    }

    #[test]
    fn oversized_index_is_truncated() {
        let record = AccelInstance::from_address(0)
            .with_custom_index(0xFF12_3456)
            .record();
        assert_eq!(record.custom_index_and_mask, 0xFF12_3456);

        let record = AccelInstance::from_address(0)
            .with_custom_index(0x0112_3456)
            .with_mask(0)
            .record();
        assert_eq!(record.custom_index_and_mask, 0x0012_3456);
    }

    #[test]
    fn default_mask_is_full() {
        let record = AccelInstance::from_address(0).record();
        assert_eq!(record.custom_index_and_mask >> 24, 0xFF);
    }

    #[test]
    fn three_instances_over_two_blases() {
        let (a, b) = (0x10_0000, 0x20_0000);
        let instances = [
            AccelInstance::from_address(a),
            AccelInstance::from_address(b).with_transform(Mat4::from_scale(Vec3::splat(2.0))),
            AccelInstance::from_address(a).with_transform(Mat4::from_rotation_translation(
                Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
                Vec3::new(0.0, 0.0, -5.0),
            )),
        ];

        let records = serialize_instances(&instances);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.blas_reference).collect::<Vec<_>>(),
            vec![a, b, a]
        );
        assert!(records.iter().all(|r| r.custom_index_and_mask >> 24 == 0xFF));

        let bytes: &[u8] = bytemuck::cast_slice(&records);
        assert_eq!(bytes.len(), 3 * 64);
        assert_eq!(&bytes[64..112], bytemuck::bytes_of(&records[1].transform));
        assert_relative_eq!(records[1].transform[0], 2.0);
        assert_relative_eq!(records[1].transform[5], 2.0);
        assert_relative_eq!(records[1].transform[10], 2.0);
        assert_relative_eq!(records[2].transform[11], -5.0);
        assert_eq!(&bytes[120..128], &b.to_ne_bytes());
        assert_eq!(&bytes[184..192], &a.to_ne_bytes());
    }
}
