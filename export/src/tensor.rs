use anyhow::{bail, ensure, format_err};
use tract_core::internal::*;

use crate::tfpb::tensorflow::tensor_shape_proto::Dim;
use crate::tfpb::tensorflow::{DataType, TensorProto, TensorShapeProto};

impl TryFrom<DataType> for DatumType {
    type Error = anyhow::Error;
    fn try_from(t: DataType) -> anyhow::Result<DatumType> {
        match t {
            DataType::DtBool => Ok(DatumType::Bool),
            DataType::DtUint8 => Ok(DatumType::U8),
            DataType::DtUint16 => Ok(DatumType::U16),
            DataType::DtUint32 => Ok(DatumType::U32),
            DataType::DtUint64 => Ok(DatumType::U64),
            DataType::DtInt8 => Ok(DatumType::I8),
            DataType::DtInt16 => Ok(DatumType::I16),
            DataType::DtInt32 => Ok(DatumType::I32),
            DataType::DtInt64 => Ok(DatumType::I64),
            DataType::DtHalf => Ok(DatumType::F16),
            DataType::DtFloat => Ok(DatumType::F32),
            DataType::DtDouble => Ok(DatumType::F64),
            DataType::DtString => Ok(DatumType::Blob),
            _ => bail!("Unknown DatumType {:?}", t),
        }
    }
}

impl TryFrom<DatumType> for DataType {
    type Error = anyhow::Error;
    fn try_from(dt: DatumType) -> anyhow::Result<DataType> {
        match dt {
            DatumType::Bool => Ok(DataType::DtBool),
            DatumType::U8 => Ok(DataType::DtUint8),
            DatumType::U16 => Ok(DataType::DtUint16),
            DatumType::U32 => Ok(DataType::DtUint32),
            DatumType::U64 => Ok(DataType::DtUint64),
            DatumType::I8 => Ok(DataType::DtInt8),
            DatumType::I16 => Ok(DataType::DtInt16),
            DatumType::I32 => Ok(DataType::DtInt32),
            DatumType::I64 => Ok(DataType::DtInt64),
            DatumType::F16 => Ok(DataType::DtHalf),
            DatumType::F32 => Ok(DataType::DtFloat),
            DatumType::F64 => Ok(DataType::DtDouble),
            DatumType::Blob => Ok(DataType::DtString),
            _ => bail!("DatumType {:?} is not translatable in protobuf", dt),
        }
    }
}

impl From<&[usize]> for TensorShapeProto {
    fn from(dims: &[usize]) -> TensorShapeProto {
        TensorShapeProto {
            dim: dims.iter().map(|d| Dim { size: *d as i64, name: String::new() }).collect(),
            unknown_rank: false,
        }
    }
}

fn tensor_from_repeated_field<T: Datum>(shape: &[usize], data: Vec<T>) -> anyhow::Result<Tensor> {
    let len = shape.iter().product::<usize>();
    let t = if data.len() == 1 && len != 1 {
        tract_ndarray::ArrayD::from_elem(shape, data[0].clone()).into()
    } else if data.is_empty() && len > 0 {
        tract_ndarray::ArrayD::<T>::default(shape).into()
    } else {
        tract_ndarray::ArrayD::from_shape_vec(shape, data)?.into()
    };
    Ok(t)
}

trait LeBytes: Datum + Copy {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn extend_le(self, buf: &mut Vec<u8>);
}

macro_rules! le_bytes {
    ($($t:ty),*) => {
        $(impl LeBytes for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn from_le(bytes: &[u8]) -> Self {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                b.copy_from_slice(bytes);
                <$t>::from_le_bytes(b)
            }
            fn extend_le(self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes())
            }
        })*
    }
}

le_bytes!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64);

fn tensor_from_content<T: LeBytes>(shape: &[usize], content: &[u8]) -> anyhow::Result<Tensor> {
    ensure!(
        content.len() == shape.iter().product::<usize>() * T::SIZE,
        "Tensor content is {} bytes, expected {:?} x {:?}",
        content.len(),
        shape,
        T::datum_type()
    );
    let data: Vec<T> = content.chunks_exact(T::SIZE).map(T::from_le).collect();
    Tensor::from_shape(shape, &data)
}

fn content_from_tensor<T: LeBytes>(t: &Tensor) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(t.len() * T::SIZE);
    for v in t.as_slice::<T>()? {
        v.extend_le(&mut buf);
    }
    Ok(buf)
}

impl TryFrom<&TensorProto> for Tensor {
    type Error = anyhow::Error;
    fn try_from(t: &TensorProto) -> anyhow::Result<Tensor> {
        let shape = t.tensor_shape.as_ref().ok_or_else(|| format_err!("TensorProto without shape"))?;
        ensure!(shape.dim.iter().all(|d| d.size >= 0), "Negative dim found in constant tensor");
        let dims: TVec<usize> = shape.dim.iter().map(|d| d.size as usize).collect();
        let dtype =
            DataType::from_i32(t.dtype).ok_or_else(|| format_err!("Invalid dtype {}", t.dtype))?;
        let content = &t.tensor_content;
        let mat = if !content.is_empty() {
            match dtype {
                DataType::DtFloat => tensor_from_content::<f32>(&dims, content)?,
                DataType::DtDouble => tensor_from_content::<f64>(&dims, content)?,
                DataType::DtInt8 => tensor_from_content::<i8>(&dims, content)?,
                DataType::DtInt16 => tensor_from_content::<i16>(&dims, content)?,
                DataType::DtInt32 => tensor_from_content::<i32>(&dims, content)?,
                DataType::DtInt64 => tensor_from_content::<i64>(&dims, content)?,
                DataType::DtUint8 => tensor_from_content::<u8>(&dims, content)?,
                DataType::DtUint16 => tensor_from_content::<u16>(&dims, content)?,
                DataType::DtUint32 => tensor_from_content::<u32>(&dims, content)?,
                DataType::DtUint64 => tensor_from_content::<u64>(&dims, content)?,
                _ => bail!("missing type (for tensor_content) {:?}", dtype),
            }
        } else {
            match dtype {
                DataType::DtInt32 => tensor_from_repeated_field(&dims, t.int_val.to_vec())?,
                DataType::DtInt64 => tensor_from_repeated_field(&dims, t.int64_val.to_vec())?,
                DataType::DtFloat => tensor_from_repeated_field(&dims, t.float_val.to_vec())?,
                DataType::DtDouble => tensor_from_repeated_field(&dims, t.double_val.to_vec())?,
                DataType::DtBool => tensor_from_repeated_field(&dims, t.bool_val.to_vec())?,
                DataType::DtString => {
                    let strings = t
                        .string_val
                        .iter()
                        .map(|s| Blob::try_from(&**s))
                        .collect::<TractResult<Vec<Blob>>>()?;
                    tensor_from_repeated_field(&dims, strings)?
                }
                _ => bail!("missing type (for _val()) {:?}", dtype),
            }
        };
        Ok(mat)
    }
}

impl TryFrom<&Tensor> for TensorProto {
    type Error = anyhow::Error;
    fn try_from(from: &Tensor) -> anyhow::Result<TensorProto> {
        let dt = DataType::try_from(from.datum_type())?;
        let mut tensor = TensorProto {
            dtype: dt.into(),
            tensor_shape: Some(from.shape().into()),
            ..TensorProto::default()
        };
        tensor.tensor_content = match from.datum_type() {
            DatumType::F32 => content_from_tensor::<f32>(from)?,
            DatumType::F64 => content_from_tensor::<f64>(from)?,
            DatumType::I8 => content_from_tensor::<i8>(from)?,
            DatumType::I16 => content_from_tensor::<i16>(from)?,
            DatumType::I32 => content_from_tensor::<i32>(from)?,
            DatumType::I64 => content_from_tensor::<i64>(from)?,
            DatumType::U8 => content_from_tensor::<u8>(from)?,
            DatumType::U16 => content_from_tensor::<u16>(from)?,
            DatumType::U32 => content_from_tensor::<u32>(from)?,
            DatumType::U64 => content_from_tensor::<u64>(from)?,
            DatumType::Bool => {
                tensor.bool_val = from.as_slice::<bool>()?.to_vec();
                vec![]
            }
            _ => bail!("missing type {:?}", from.datum_type()),
        };
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_content() -> anyhow::Result<()> {
        let t = Tensor::from_shape(&[2, 3], &[1f32, -2.0, 3.5, 0.0, 1e-3, 7.0])?;
        let proto = TensorProto::try_from(&t)?;
        assert_eq!(proto.tensor_content.len(), 24);
        assert!(proto.float_val.is_empty());
        assert_eq!(Tensor::try_from(&proto)?, t);
        Ok(())
    }

    #[test]
    fn repeated_field_with_broadcast() -> anyhow::Result<()> {
        let proto = TensorProto {
            dtype: DataType::DtFloat.into(),
            tensor_shape: Some((&[2usize, 2][..]).into()),
            float_val: vec![0.5],
            ..TensorProto::default()
        };
        let t = Tensor::try_from(&proto)?;
        assert_eq!(t, Tensor::from_shape(&[2, 2], &[0.5f32; 4])?);
        Ok(())
    }

    #[test]
    fn scalar_int64() -> anyhow::Result<()> {
        let t = tensor0(12i64);
        let proto = TensorProto::try_from(&t)?;
        assert_eq!(proto.tensor_shape.as_ref().unwrap().dim.len(), 0);
        assert_eq!(Tensor::try_from(&proto)?, t);
        Ok(())
    }

    #[test]
    fn truncated_content_is_an_error() {
        let proto = TensorProto {
            dtype: DataType::DtFloat.into(),
            tensor_shape: Some((&[3usize][..]).into()),
            tensor_content: vec![0; 8],
            ..TensorProto::default()
        };
        assert!(Tensor::try_from(&proto).is_err());
    }
}
